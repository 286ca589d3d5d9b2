//! Registry of participants that completed the handshake.

use log::debug;
use zeroize::Zeroizing;

use crate::crypto::KEY_LEN;
use crate::error::GroupCallError;
use crate::frame::{MediaKeyHistory, MediaKeySet};
use crate::handshake::{HandshakeResult, HandshakeState};
use crate::types::{MediaKind, ParticipantId};

/// What a remote participant sends and what we receive from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteMediaState {
    pub audio_on: bool,
    pub video_on: bool,
    pub video_subscribed: bool,
}

pub struct Participant {
    id: ParticipantId,
    identity: String,
    handshake_state: HandshakeState,
    pairwise_key: Zeroizing<[u8; KEY_LEN]>,
    media_keys: MediaKeyHistory,
    media: RemoteMediaState,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    pub fn pairwise_key(&self) -> &[u8; KEY_LEN] {
        &self.pairwise_key
    }

    pub fn media_keys(&self) -> &MediaKeyHistory {
        &self.media_keys
    }

    pub fn media(&self) -> RemoteMediaState {
        self.media
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("epoch", &self.media_keys.epoch())
            .field("media", &self.media)
            .finish_non_exhaustive()
    }
}

/// Joined participants in join order.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: Vec<Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: ParticipantId,
        result: HandshakeResult,
    ) -> Result<&Participant, GroupCallError> {
        if self.contains(id) {
            return Err(GroupCallError::BadParticipantState(id.get()));
        }
        self.participants.push(Participant {
            id,
            identity: result.identity,
            handshake_state: HandshakeState::Complete,
            pairwise_key: result.pairwise_key,
            media_keys: result.media_keys,
            media: RemoteMediaState::default(),
        });
        Ok(&self.participants[self.participants.len() - 1])
    }

    /// Removes `id` if present and ratchets everybody left behind.
    pub fn remove(&mut self, id: ParticipantId) -> Result<bool, GroupCallError> {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        if self.participants.len() == before {
            return Ok(false);
        }
        debug!(target: "GroupCall/Registry", "Removed {id}, ratcheting {} remaining", self.participants.len());
        self.ratchet_all()?;
        Ok(true)
    }

    pub fn ratchet_all(&mut self) -> Result<(), GroupCallError> {
        self.participants
            .iter_mut()
            .try_for_each(|p| p.media_keys.ratchet())
    }

    pub fn all(&self) -> &[Participant] {
        &self.participants
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(|p| p.id).collect()
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.get(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn get_mut(&mut self, id: ParticipantId) -> Result<&mut Participant, GroupCallError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(GroupCallError::BadParticipantState(id.get()))
    }

    /// Returns `true` if the state changed.
    pub fn set_capture_state(
        &mut self,
        id: ParticipantId,
        kind: MediaKind,
        on: bool,
    ) -> Result<bool, GroupCallError> {
        let media = &mut self.get_mut(id)?.media;
        let slot = match kind {
            MediaKind::Audio => &mut media.audio_on,
            MediaKind::Video => &mut media.video_on,
        };
        let changed = *slot != on;
        *slot = on;
        Ok(changed)
    }

    pub fn set_video_subscribed(
        &mut self,
        id: ParticipantId,
        subscribed: bool,
    ) -> Result<(), GroupCallError> {
        self.get_mut(id)?.media.video_subscribed = subscribed;
        Ok(())
    }

    pub fn apply_rekey(
        &mut self,
        id: ParticipantId,
        key_set: MediaKeySet,
    ) -> Result<(), GroupCallError> {
        self.get_mut(id)?.media_keys.set_pending(key_set)
    }

    pub fn decrypt(&mut self, id: ParticipantId, frame: &[u8]) -> Result<Vec<u8>, GroupCallError> {
        self.get_mut(id)?.media_keys.decrypt(frame, id)
    }

    /// Drops every participant and its keys.
    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encrypt_frame;

    fn result(identity: &str, key: MediaKeySet) -> HandshakeResult {
        HandshakeResult {
            identity: identity.into(),
            pairwise_key: Zeroizing::new([1; KEY_LEN]),
            media_keys: MediaKeyHistory::new(key),
        }
    }

    #[test]
    fn add_twice_is_a_bad_state() {
        let mut registry = ParticipantRegistry::new();
        registry
            .add(ParticipantId(2), result("B", MediaKeySet::from_parts(0, [2; 32])))
            .unwrap();
        assert_eq!(
            registry
                .add(ParticipantId(2), result("B", MediaKeySet::from_parts(0, [2; 32])))
                .unwrap_err(),
            GroupCallError::BadParticipantState(2)
        );
        assert_eq!(
            registry.get(ParticipantId(2)).unwrap().handshake_state(),
            HandshakeState::Complete
        );
    }

    #[test]
    fn leave_ratchets_the_rest() {
        let mut registry = ParticipantRegistry::new();
        registry
            .add(ParticipantId(2), result("B", MediaKeySet::from_parts(0, [2; 32])))
            .unwrap();
        registry
            .add(ParticipantId(3), result("C", MediaKeySet::from_parts(5, [3; 32])))
            .unwrap();

        assert!(registry.remove(ParticipantId(2)).unwrap());
        assert_eq!(registry.ids(), vec![ParticipantId(3)]);
        assert_eq!(registry.get(ParticipantId(3)).unwrap().media_keys().epoch(), 6);

        assert!(!registry.remove(ParticipantId(2)).unwrap());
        assert_eq!(registry.get(ParticipantId(3)).unwrap().media_keys().epoch(), 6);
    }

    #[test]
    fn keeps_join_order() {
        let mut registry = ParticipantRegistry::new();
        for id in [7, 3, 5] {
            registry
                .add(ParticipantId(id), result("X", MediaKeySet::from_parts(0, [0; 32])))
                .unwrap();
        }
        assert_eq!(
            registry.ids(),
            vec![ParticipantId(7), ParticipantId(3), ParticipantId(5)]
        );
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn decrypt_routes_to_the_sender() {
        let mut registry = ParticipantRegistry::new();
        let mut b_key = MediaKeySet::from_parts(0, [2; 32]);
        registry
            .add(ParticipantId(2), result("B", b_key.clone()))
            .unwrap();
        registry
            .add(ParticipantId(3), result("C", MediaKeySet::from_parts(0, [3; 32])))
            .unwrap();

        let frame = encrypt_frame(b"voice", &mut b_key).unwrap();
        assert_eq!(registry.decrypt(ParticipantId(2), &frame).unwrap(), b"voice");
        assert_eq!(
            registry.decrypt(ParticipantId(3), &frame),
            Err(GroupCallError::FrameCryptoFailure(3))
        );
        assert_eq!(
            registry.decrypt(ParticipantId(9), &frame),
            Err(GroupCallError::BadParticipantState(9))
        );
    }

    #[test]
    fn capture_state_changes() {
        let mut registry = ParticipantRegistry::new();
        registry
            .add(ParticipantId(2), result("B", MediaKeySet::from_parts(0, [2; 32])))
            .unwrap();
        assert!(registry
            .set_capture_state(ParticipantId(2), MediaKind::Audio, true)
            .unwrap());
        assert!(!registry
            .set_capture_state(ParticipantId(2), MediaKind::Audio, true)
            .unwrap());
        registry.set_video_subscribed(ParticipantId(2), true).unwrap();
        assert_eq!(
            registry.get(ParticipantId(2)).unwrap().media(),
            RemoteMediaState {
                audio_on: true,
                video_on: false,
                video_subscribed: true,
            }
        );
    }
}
