//! Media frame encryption and the per-participant key ratchet.
//!
//! Every participant encrypts its media with its own [`MediaKeySet`]. The set
//! is ratcheted forward (one way) on every membership change, so a newcomer
//! cannot read what was sent before it joined. A frame carries its key epoch
//! and nonce counter in the clear:
//!
//! ```text
//! epoch (4, BE) || counter (8, BE) || AES-256-GCM ciphertext + tag
//! ```
//!
//! The first 12 bytes double as the AEAD nonce.
//!
//! The epoch packs a key generation (high 16 bits) and a ratchet count (low
//! 16 bits). Ratchets advance the count, a rekey opens the next generation,
//! so a ratcheted key and a rekeyed one never share an epoch.

use log::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_LEN, NONCE_LEN, TAG_LEN, aead_decrypt, aead_encrypt, derive_key};
use crate::error::GroupCallError;
use crate::types::ParticipantId;

pub const FRAME_HEADER_LEN: usize = NONCE_LEN;

const MEDIA_SALT: &[u8] = b"group-call-media";

const RATCHET_BITS: u32 = 16;
const RATCHET_MASK: u32 = (1 << RATCHET_BITS) - 1;

/// How far ahead of the known key a frame may be before it is rejected
/// instead of ratcheted up to.
pub const MAX_CATCH_UP_RATCHETS: u32 = 8;

/// Media key of one participant at one epoch.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MediaKeySet {
    epoch: u32,
    key: [u8; KEY_LEN],
    counter: u64,
}

impl MediaKeySet {
    /// Initial key at epoch 0, derived from a shared secret.
    pub fn derive_initial(shared_secret: &[u8]) -> Result<Self, GroupCallError> {
        let key = derive_key(shared_secret, MEDIA_SALT, b"initial")?;
        Ok(Self::from_parts(0, *key))
    }

    /// Key set received from a peer (or freshly generated for a rekey).
    pub fn from_parts(epoch: u32, key: [u8; KEY_LEN]) -> Self {
        Self {
            epoch,
            key,
            counter: 0,
        }
    }

    pub fn from_slice(epoch: u32, key: &[u8]) -> Result<Self, GroupCallError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            GroupCallError::BadMessage(format!("media key must be {KEY_LEN} bytes"))
        })?;
        Ok(Self::from_parts(epoch, key))
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn generation(&self) -> u32 {
        self.epoch >> RATCHET_BITS
    }

    pub fn ratchet_count(&self) -> u32 {
        self.epoch & RATCHET_MASK
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Next epoch. The new key cannot be used to recover this one.
    pub fn ratchet(&self) -> Result<Self, GroupCallError> {
        if self.ratchet_count() == RATCHET_MASK {
            return Err(GroupCallError::KeyRatchetError(format!(
                "ratchet count exhausted in generation {}",
                self.generation()
            )));
        }
        let key = derive_key(&self.key, MEDIA_SALT, b"ratchet")?;
        Ok(Self::from_parts(self.epoch + 1, *key))
    }

    /// A fresh `key` opening the generation after this one.
    pub fn rekeyed(&self, key: [u8; KEY_LEN]) -> Result<Self, GroupCallError> {
        let generation = self
            .generation()
            .checked_add(1)
            .filter(|generation| *generation <= u32::MAX >> RATCHET_BITS)
            .ok_or_else(|| GroupCallError::KeyRatchetError("epoch overflow".into()))?;
        Ok(Self::from_parts(generation << RATCHET_BITS, key))
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], GroupCallError> {
        if self.counter == u64::MAX {
            return Err(GroupCallError::KeyRatchetError(
                "nonce counter exhausted".into(),
            ));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}

impl PartialEq for MediaKeySet {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch && self.key == other.key
    }
}

impl Eq for MediaKeySet {}

impl std::fmt::Debug for MediaKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaKeySet")
            .field("epoch", &self.epoch)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Encrypts one frame under `key_set`, consuming one nonce.
pub fn encrypt_frame(plaintext: &[u8], key_set: &mut MediaKeySet) -> Result<Vec<u8>, GroupCallError> {
    let header = key_set.next_nonce()?;
    let ciphertext = aead_encrypt(&key_set.key, &header, plaintext)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Epoch a frame claims to be encrypted under.
pub fn frame_epoch(frame: &[u8]) -> Option<u32> {
    let epoch: [u8; 4] = frame.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(epoch))
}

/// Decrypts one frame of `sender` under exactly `key_set`.
pub fn decrypt_frame(
    frame: &[u8],
    key_set: &MediaKeySet,
    sender: ParticipantId,
) -> Result<Vec<u8>, GroupCallError> {
    if frame.len() < FRAME_HEADER_LEN + TAG_LEN || frame_epoch(frame) != Some(key_set.epoch) {
        return Err(GroupCallError::FrameCryptoFailure(sender.get()));
    }
    let (header, ciphertext) = frame.split_at(FRAME_HEADER_LEN);
    let nonce: [u8; NONCE_LEN] = header
        .try_into()
        .map_err(|_| GroupCallError::FrameCryptoFailure(sender.get()))?;
    aead_decrypt(&key_set.key, &nonce, ciphertext)
        .ok_or(GroupCallError::FrameCryptoFailure(sender.get()))
}

/// The keys of one participant: the current set, at most one prior epoch
/// still accepted for in-flight frames, and an announced rekey that has not
/// been observed on the wire yet.
#[derive(Clone, Debug)]
pub struct MediaKeyHistory {
    current: MediaKeySet,
    prior: Option<MediaKeySet>,
    pending: Option<MediaKeySet>,
    /// `pending` before its last ratchet. The sender may have switched to
    /// the rekey before that ratchet.
    pending_prior: Option<MediaKeySet>,
}

impl MediaKeyHistory {
    pub fn new(current: MediaKeySet) -> Self {
        Self {
            current,
            prior: None,
            pending: None,
            pending_prior: None,
        }
    }

    pub fn current(&self) -> &MediaKeySet {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut MediaKeySet {
        &mut self.current
    }

    pub fn epoch(&self) -> u32 {
        self.current.epoch
    }

    pub fn pending(&self) -> Option<&MediaKeySet> {
        self.pending.as_ref()
    }

    pub fn pending_epoch(&self) -> Option<u32> {
        self.pending.as_ref().map(MediaKeySet::epoch)
    }

    /// The pending key if there is one, the current one otherwise.
    pub fn newest(&self) -> &MediaKeySet {
        self.pending.as_ref().unwrap_or(&self.current)
    }

    /// Epochs that can still decrypt, newest first.
    pub fn retained_epochs(&self) -> Vec<u32> {
        std::iter::once(self.current.epoch)
            .chain(self.prior.as_ref().map(MediaKeySet::epoch))
            .collect()
    }

    /// Ratchets the current key and, if present, the pending one.
    pub fn ratchet(&mut self) -> Result<(), GroupCallError> {
        let next = self.current.ratchet()?;
        let pending = self.pending.as_ref().map(MediaKeySet::ratchet).transpose()?;
        self.prior = Some(std::mem::replace(&mut self.current, next));
        self.pending_prior = std::mem::replace(&mut self.pending, pending);
        Ok(())
    }

    /// Records a key announced by its owner.
    ///
    /// A key of a later generation is a rekey and waits for the first frame
    /// under it. A key further along the current generation means the owner
    /// ratcheted for membership changes not followed here yet, so it becomes
    /// current right away. The current key itself is accepted as is.
    pub fn set_pending(&mut self, key_set: MediaKeySet) -> Result<(), GroupCallError> {
        if key_set.generation() > self.current.generation() {
            self.pending = Some(key_set);
            self.pending_prior = None;
            return Ok(());
        }
        if key_set.epoch < self.current.epoch
            || (key_set.epoch == self.current.epoch && key_set != self.current)
        {
            return Err(GroupCallError::KeyRatchetError(format!(
                "rekey to epoch {} while at epoch {}",
                key_set.epoch, self.current.epoch
            )));
        }
        if key_set.epoch > self.current.epoch {
            match self.caught_up(key_set.epoch) {
                Some(ahead) if ahead.current == key_set => *self = ahead,
                _ => self.prior = Some(std::mem::replace(&mut self.current, key_set)),
            }
        }
        Ok(())
    }

    /// Makes the pending key current. Returns `false` if there was none.
    pub fn apply_pending(&mut self) -> bool {
        self.pending_prior = None;
        match self.pending.take() {
            Some(next) => {
                self.prior = Some(std::mem::replace(&mut self.current, next));
                true
            }
            None => false,
        }
    }

    /// Tries the current epoch, then the prior one. A frame under the
    /// pending key (or its predecessor) means the sender switched to it. A
    /// frame a few ratchets ahead is decrypted by catching up.
    pub fn decrypt(
        &mut self,
        frame: &[u8],
        sender: ParticipantId,
    ) -> Result<Vec<u8>, GroupCallError> {
        let failure = || GroupCallError::FrameCryptoFailure(sender.get());
        let epoch = frame_epoch(frame).ok_or_else(failure)?;

        let retained = std::iter::once(&self.current)
            .chain(self.prior.as_ref())
            .filter(|key_set| key_set.epoch == epoch)
            .find_map(|key_set| decrypt_frame(frame, key_set, sender).ok());
        if let Some(plaintext) = retained {
            return Ok(plaintext);
        }
        if let Some(plaintext) = self.switch_to_pending(frame, epoch, sender) {
            debug!(target: "GroupCall/Frame", "{sender} switched to rekeyed epoch {epoch}");
            return Ok(plaintext);
        }

        let ahead = self.caught_up(epoch).ok_or_else(failure)?;
        let plaintext = decrypt_frame(frame, &ahead.current, sender)?;
        debug!(
            target: "GroupCall/Frame",
            "{sender} is ahead, caught up from epoch {} to {epoch}",
            self.current.epoch
        );
        *self = ahead;
        Ok(plaintext)
    }

    fn switch_to_pending(
        &mut self,
        frame: &[u8],
        epoch: u32,
        sender: ParticipantId,
    ) -> Option<Vec<u8>> {
        let pending = self.pending.as_ref()?;
        if pending.epoch == epoch {
            let plaintext = decrypt_frame(frame, pending, sender).ok()?;
            self.apply_pending();
            return Some(plaintext);
        }

        // Switched first, then ratcheted.
        let before = self.pending_prior.as_ref().filter(|key_set| key_set.epoch == epoch)?;
        let plaintext = decrypt_frame(frame, before, sender).ok()?;
        let next = self.pending.take()?;
        self.prior = self.pending_prior.take();
        self.current = next;
        Some(plaintext)
    }

    /// This history ratcheted up to `epoch`, if that lies a few ratchets
    /// ahead within the current generation.
    fn caught_up(&self, epoch: u32) -> Option<Self> {
        let steps = epoch.checked_sub(self.current.epoch)?;
        if steps == 0
            || steps > MAX_CATCH_UP_RATCHETS
            || epoch >> RATCHET_BITS != self.current.generation()
        {
            return None;
        }
        let mut ahead = self.clone();
        for _ in 0..steps {
            ahead.ratchet().ok()?;
        }
        Some(ahead)
    }
}
