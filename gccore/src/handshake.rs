//! Participant handshake.
//!
//! Both sides send a `Hello` (identity and public key, encrypted with the
//! call-wide handshake key). Once a side knows the peer's public key it derives
//! the pairwise key and sends a `HelloAck` with its current media key under
//! it. The handshake is complete once the peer's `HelloAck` arrived.
//!
//! The initiator is the participant that just joined and greets everybody
//! already in the call. The responder greets back once the initiator's
//! `Hello` arrives.

use zeroize::Zeroizing;

use crate::crypto::{CallCrypto, KEY_LEN, KeyPair};
use crate::error::GroupCallError;
use crate::frame::{MediaKeyHistory, MediaKeySet};
use crate::keys::GroupCallKeys;
use crate::types::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitHello,
    AwaitHelloAck,
    Complete,
}

/// A participant announced by the SFU whose handshake has not completed.
pub struct PendingParticipant {
    id: ParticipantId,
    role: HandshakeRole,
    state: HandshakeState,
    identity: Option<String>,
    pairwise_key: Option<Zeroizing<[u8; KEY_LEN]>>,
    /// Epoch of the media key our `HelloAck` carried.
    acked_epoch: Option<u32>,
}

/// Outcome of a completed handshake, ready to be registered.
pub struct HandshakeResult {
    pub identity: String,
    pub pairwise_key: Zeroizing<[u8; KEY_LEN]>,
    pub media_keys: MediaKeyHistory,
}

impl PendingParticipant {
    pub fn new(id: ParticipantId, role: HandshakeRole) -> Self {
        Self {
            id,
            role,
            state: HandshakeState::AwaitHello,
            identity: None,
            pairwise_key: None,
            acked_epoch: None,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn pairwise_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.pairwise_key.as_deref()
    }

    pub fn acked_epoch(&self) -> Option<u32> {
        self.acked_epoch
    }

    /// Notes the media key sent in our `HelloAck`. If it is ratcheted past
    /// before the handshake completes, the peer needs the newer key.
    pub fn record_hello_ack(&mut self, key_set: &MediaKeySet) {
        self.acked_epoch = Some(key_set.epoch());
    }

    /// Whether our `HelloAck` carried an older key than `current`.
    pub fn acked_key_is_stale(&self, current: &MediaKeySet) -> bool {
        self.acked_epoch
            .is_some_and(|epoch| epoch != current.epoch())
    }

    /// Processes the peer's `Hello` and derives the pairwise key.
    pub fn handle_hello(
        &mut self,
        crypto: &dyn CallCrypto,
        keys: &GroupCallKeys,
        local: &KeyPair,
        identity: String,
        peer_public: &[u8; KEY_LEN],
    ) -> Result<(), GroupCallError> {
        if self.state != HandshakeState::AwaitHello {
            return Err(GroupCallError::RemoteProtocolViolation(format!(
                "unexpected Hello from {} in state {:?}",
                self.id, self.state
            )));
        }
        let shared = crypto.shared_secret(local, peer_public)?;
        self.pairwise_key = Some(keys.derive_pairwise(&shared)?);
        self.identity = Some(identity);
        self.state = HandshakeState::AwaitHelloAck;
        Ok(())
    }

    /// Processes the peer's `HelloAck`, completing the handshake.
    pub fn handle_hello_ack(
        mut self,
        media_key: MediaKeySet,
    ) -> Result<HandshakeResult, GroupCallError> {
        let (Some(identity), Some(pairwise_key), HandshakeState::AwaitHelloAck) =
            (self.identity.take(), self.pairwise_key.take(), self.state)
        else {
            return Err(GroupCallError::RemoteProtocolViolation(format!(
                "unexpected HelloAck from {} in state {:?}",
                self.id, self.state
            )));
        };
        Ok(HandshakeResult {
            identity,
            pairwise_key,
            media_keys: MediaKeyHistory::new(media_key),
        })
    }
}

impl std::fmt::Debug for PendingParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingParticipant")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .field("acked_epoch", &self.acked_epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCallCrypto;
    use crate::types::GroupCallKey;

    #[test]
    fn both_sides_agree_on_the_pairwise_key() {
        let crypto = DefaultCallCrypto::from_seed(21);
        let keys = GroupCallKeys::derive(&GroupCallKey::from_bytes([1; 32])).unwrap();
        let alice = crypto.generate_key_pair();
        let bob = crypto.generate_key_pair();

        let mut alice_view = PendingParticipant::new(ParticipantId(2), HandshakeRole::Initiator);
        let mut bob_view = PendingParticipant::new(ParticipantId(1), HandshakeRole::Responder);
        alice_view
            .handle_hello(&crypto, &keys, &alice, "BOBBOBBO".into(), &bob.public_key())
            .unwrap();
        bob_view
            .handle_hello(&crypto, &keys, &bob, "ALICEALI".into(), &alice.public_key())
            .unwrap();

        assert_eq!(alice_view.pairwise_key(), bob_view.pairwise_key());
        assert_eq!(alice_view.state(), HandshakeState::AwaitHelloAck);

        let result = alice_view
            .handle_hello_ack(MediaKeySet::from_parts(4, [8; 32]))
            .unwrap();
        assert_eq!(result.identity, "BOBBOBBO");
        assert_eq!(result.media_keys.epoch(), 4);
    }

    #[test]
    fn out_of_order_messages_are_violations() {
        let crypto = DefaultCallCrypto::from_seed(22);
        let keys = GroupCallKeys::derive(&GroupCallKey::from_bytes([1; 32])).unwrap();
        let local = crypto.generate_key_pair();
        let peer = crypto.generate_key_pair();

        let early = PendingParticipant::new(ParticipantId(2), HandshakeRole::Initiator);
        assert!(matches!(
            early.handle_hello_ack(MediaKeySet::from_parts(0, [8; 32])),
            Err(GroupCallError::RemoteProtocolViolation(_))
        ));

        let mut twice = PendingParticipant::new(ParticipantId(2), HandshakeRole::Responder);
        twice
            .handle_hello(&crypto, &keys, &local, "PEERPEER".into(), &peer.public_key())
            .unwrap();
        assert!(matches!(
            twice.handle_hello(&crypto, &keys, &local, "PEERPEER".into(), &peer.public_key()),
            Err(GroupCallError::RemoteProtocolViolation(_))
        ));
    }

    #[test]
    fn acked_key_goes_stale_after_a_ratchet() {
        let mut pending = PendingParticipant::new(ParticipantId(2), HandshakeRole::Responder);
        let key_set = MediaKeySet::from_parts(3, [5; 32]);
        assert!(!pending.acked_key_is_stale(&key_set));

        pending.record_hello_ack(&key_set);
        assert_eq!(pending.acked_epoch(), Some(3));
        assert!(!pending.acked_key_is_stale(&key_set));
        assert!(pending.acked_key_is_stale(&key_set.ratchet().unwrap()));
    }
}
