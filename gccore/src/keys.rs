//! Keys derived from the group call key (GCK).

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{KEY_LEN, derive_key};
use crate::error::GroupCallError;
use crate::types::GroupCallKey;

const SALT: &[u8] = b"group-call";

/// Call-wide keys every group member can derive from the GCK.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupCallKeys {
    gck: [u8; KEY_LEN],
    /// Handshake key: protects `Hello` messages towards not yet authenticated peers.
    gchk: [u8; KEY_LEN],
    /// Call state key: protects the call state stored on the SFU.
    gcsk: [u8; KEY_LEN],
}

impl GroupCallKeys {
    pub fn derive(gck: &GroupCallKey) -> Result<Self, GroupCallError> {
        let gchk = derive_key(gck.as_bytes(), SALT, b"gchk")?;
        let gcsk = derive_key(gck.as_bytes(), SALT, b"gcsk")?;
        Ok(Self {
            gck: *gck.as_bytes(),
            gchk: *gchk,
            gcsk: *gcsk,
        })
    }

    pub fn gchk(&self) -> &[u8; KEY_LEN] {
        &self.gchk
    }

    pub fn gcsk(&self) -> &[u8; KEY_LEN] {
        &self.gcsk
    }

    /// Pairwise handshake auth key for one peer, bound to the call.
    pub fn derive_pairwise(
        &self,
        shared_secret: &[u8; KEY_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, GroupCallError> {
        let mut ikm = Zeroizing::new([0u8; 2 * KEY_LEN]);
        ikm[..KEY_LEN].copy_from_slice(&self.gck);
        ikm[KEY_LEN..].copy_from_slice(shared_secret);
        derive_key(&ikm[..], SALT, b"gcnhak")
    }
}

impl std::fmt::Debug for GroupCallKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupCallKeys(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_are_distinct() {
        let keys = GroupCallKeys::derive(&GroupCallKey::from_bytes([9; 32])).unwrap();
        assert_ne!(keys.gchk(), keys.gcsk());
        assert_ne!(keys.gchk(), &[9; 32]);
    }

    #[test]
    fn pairwise_key_depends_on_gck_and_secret() {
        let a = GroupCallKeys::derive(&GroupCallKey::from_bytes([1; 32])).unwrap();
        let b = GroupCallKeys::derive(&GroupCallKey::from_bytes([2; 32])).unwrap();
        let secret = [5u8; 32];

        assert_eq!(
            *a.derive_pairwise(&secret).unwrap(),
            *a.derive_pairwise(&secret).unwrap()
        );
        assert_ne!(
            *a.derive_pairwise(&secret).unwrap(),
            *b.derive_pairwise(&secret).unwrap()
        );
        assert_ne!(
            *a.derive_pairwise(&secret).unwrap(),
            *a.derive_pairwise(&[6u8; 32]).unwrap()
        );
    }
}
