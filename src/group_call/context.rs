//! State owned by a session once the peer connection exists.

use gccore::GroupCallError;
use gccore::codec::{self, CallStateParticipant, CallStateSnapshot, P2pMessage, RelayEnvelope, SfuRequest};
use gccore::crypto::{CallCrypto, KeyPair};
use gccore::frame::MediaKeyHistory;
use gccore::handshake::PendingParticipant;
use gccore::keys::GroupCallKeys;
use gccore::net::{PeerConnection, PeerConnectionEvent};
use gccore::registry::ParticipantRegistry;
use gccore::types::{MediaKind, ParticipantId};
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use zeroize::Zeroizing;

/// A local user action, queued in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SetCapture { kind: MediaKind, on: bool },
    SetVideoSubscription { participant: ParticipantId, subscribe: bool },
    SendAppData { to: ParticipantId, data: Vec<u8> },
    SendMediaFrame { kind: MediaKind, frame: Vec<u8> },
    Leave,
}

pub struct ConnectedContext {
    pub(crate) local_id: ParticipantId,
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) events: mpsc::Receiver<PeerConnectionEvent>,
    pub(crate) key_pair: KeyPair,
    pub(crate) keys: GroupCallKeys,
    pub(crate) local_keys: MediaKeyHistory,
    pub(crate) registry: ParticipantRegistry,
    pub(crate) pending: BTreeMap<ParticipantId, PendingParticipant>,
    pub(crate) rekey_deadline: Option<Instant>,
    pub(crate) audio_on: bool,
    pub(crate) video_on: bool,
    pub(crate) call_created_by: String,
    pub(crate) call_created_at: u64,
    /// The peer connection reported `Connected` and has not failed since.
    pub(crate) transport_open: bool,
}

impl ConnectedContext {
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn local_keys(&self) -> &MediaKeyHistory {
        &self.local_keys
    }

    /// Participants in the call, including us.
    pub fn participant_count(&self) -> usize {
        self.registry.count() + 1
    }

    /// The participant with the lowest id publishes the call state.
    pub fn publishes_call_state(&self) -> bool {
        self.registry.all().iter().all(|p| p.id() > self.local_id)
    }

    pub(crate) fn call_state(&self, local_identity: &str) -> CallStateSnapshot {
        let mut participants = vec![CallStateParticipant {
            id: self.local_id,
            identity: local_identity.to_string(),
        }];
        participants.extend(self.registry.all().iter().map(|p| CallStateParticipant {
            id: p.id(),
            identity: p.identity().to_string(),
        }));
        CallStateSnapshot {
            created_by: self.call_created_by.clone(),
            created_at: self.call_created_at,
            participants,
        }
    }

    /// Sends to the SFU. A failed send marks the transport as gone, the
    /// message loop ends the session on its next turn.
    pub(crate) async fn send_to_sfu(&mut self, crypto: &dyn CallCrypto, request: &SfuRequest) {
        if !self.transport_open {
            return;
        }
        let bytes = codec::encode_sfu_request(request, crypto.padding());
        if let Err(e) = self.connection.send(&bytes).await {
            warn!(target: "GroupCall/Connection", "Send to SFU failed: {e:?}");
            self.transport_open = false;
        }
    }

    /// Seals `message` under `key` and relays it to `to`.
    pub(crate) async fn send_to_participant(
        &mut self,
        crypto: &dyn CallCrypto,
        to: ParticipantId,
        key: &[u8; 32],
        message: &P2pMessage,
    ) -> Result<(), GroupCallError> {
        let encrypted_data = codec::seal_p2p(crypto, key, message)?;
        let envelope = RelayEnvelope {
            sender: self.local_id,
            receiver: to,
            encrypted_data,
        };
        self.send_to_sfu(crypto, &SfuRequest::Relay(envelope)).await;
        Ok(())
    }

    /// Sends `message` to every registered participant under its pairwise key.
    pub(crate) async fn broadcast(
        &mut self,
        crypto: &dyn CallCrypto,
        message: &P2pMessage,
    ) -> Result<(), GroupCallError> {
        let targets: Vec<(ParticipantId, Zeroizing<[u8; 32]>)> = self
            .registry
            .all()
            .iter()
            .map(|p| (p.id(), Zeroizing::new(*p.pairwise_key())))
            .collect();
        for (id, key) in targets {
            self.send_to_participant(crypto, id, &key, message).await?;
        }
        Ok(())
    }

    /// Forgets every participant and all key material.
    pub(crate) fn wipe(&mut self) {
        self.registry.clear();
        self.pending.clear();
        self.rekey_deadline = None;
    }
}
