//! Crypto primitives consumed by the call layer.
//!
//! The session never calls a cipher directly for its signalling traffic; it
//! goes through the [`CallCrypto`] capability handed in at construction time.
//! [`DefaultCallCrypto`] is the production implementation. Tests use
//! [`DefaultCallCrypto::from_seed`] to make every random choice reproducible.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use std::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::GroupCallError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const MAX_PADDING: usize = 32;

/// An X25519 key pair used for the participant handshake.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Capability interface for every primitive the coordinator needs.
pub trait CallCrypto: Send + Sync {
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    fn generate_key_pair(&self) -> KeyPair;

    /// Diffie-Hellman between our secret and a peer public key.
    fn shared_secret(
        &self,
        local: &KeyPair,
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, GroupCallError>;

    /// AEAD encrypt. Output is `nonce || ciphertext || tag`.
    fn seal(&self, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, GroupCallError>;

    /// Reverse of [`CallCrypto::seal`].
    fn open(&self, key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, GroupCallError>;

    /// Random padding added to every envelope.
    fn padding(&self) -> Vec<u8> {
        let len = self.random_bytes(1)[0] as usize % (MAX_PADDING + 1);
        vec![0u8; len]
    }

    fn random_key(&self) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&self.random_bytes(KEY_LEN));
        key
    }
}

/// HKDF-SHA256 expansion to a 32-byte key.
pub fn derive_key(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, GroupCallError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| GroupCallError::KeyRatchetError(format!("hkdf expand failed: {e}")))?;
    Ok(okm)
}

/// AES-256-GCM with a caller supplied nonce.
pub fn aead_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, GroupCallError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| GroupCallError::EncryptionFailure)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| GroupCallError::EncryptionFailure)
}

/// AES-256-GCM decryption. `None` when the tag does not verify.
pub fn aead_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Option<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

/// Production [`CallCrypto`] backed by AES-256-GCM, X25519 and a CSPRNG.
pub struct DefaultCallCrypto {
    rng: Mutex<StdRng>,
}

impl DefaultCallCrypto {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic instance. Never use outside of tests and replays.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for DefaultCallCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl CallCrypto for DefaultCallCrypto {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.fill_bytes(&mut out);
        out
    }

    fn generate_key_pair(&self) -> KeyPair {
        let mut secret = Zeroizing::new([0u8; KEY_LEN]);
        secret.copy_from_slice(&self.random_bytes(KEY_LEN));
        KeyPair::from_secret_bytes(*secret)
    }

    fn shared_secret(
        &self,
        local: &KeyPair,
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, GroupCallError> {
        let shared = local.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(GroupCallError::RemoteProtocolViolation(
                "non-contributory public key".into(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn seal(&self, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, GroupCallError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&self.random_bytes(NONCE_LEN));
        let ciphertext = aead_encrypt(key, &nonce, plaintext)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, GroupCallError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(GroupCallError::bad_message("sealed payload too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| GroupCallError::bad_message("bad nonce"))?;
        aead_decrypt(key, &nonce, ciphertext)
            .ok_or_else(|| GroupCallError::bad_message("could not decrypt payload"))
    }
}
