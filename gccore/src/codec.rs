//! Conversion between the protobuf envelopes and the typed messages the
//! session works with. Any decoding problem is a [`GroupCallError::BadMessage`].

use prost::Message;

use crate::crypto::{CallCrypto, KEY_LEN};
use crate::error::GroupCallError;
use crate::frame::MediaKeySet;
use crate::keys::GroupCallKeys;
use crate::proto::{
    self, participant_to_participant as p2p, participant_to_sfu as to_sfu,
    sfu_to_participant as from_sfu,
};
use crate::types::{MediaKind, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub encrypted_data: Vec<u8>,
}

impl From<proto::OuterEnvelope> for RelayEnvelope {
    fn from(env: proto::OuterEnvelope) -> Self {
        Self {
            sender: ParticipantId(env.sender),
            receiver: ParticipantId(env.receiver),
            encrypted_data: env.encrypted_data,
        }
    }
}

impl From<&RelayEnvelope> for proto::OuterEnvelope {
    fn from(env: &RelayEnvelope) -> Self {
        Self {
            sender: env.sender.get(),
            receiver: env.receiver.get(),
            encrypted_data: env.encrypted_data.clone(),
        }
    }
}

/// Message from the SFU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfuMessage {
    Relay(RelayEnvelope),
    /// Participants present when we connected.
    Hello(Vec<ParticipantId>),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
}

/// Message to the SFU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfuRequest {
    Relay(RelayEnvelope),
    UpdateCallState(Vec<u8>),
    RequestVideo {
        participant: ParticipantId,
        subscribe: bool,
    },
    Leave,
}

/// Decrypted message from another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pMessage {
    Hello {
        identity: String,
        public_key: [u8; KEY_LEN],
    },
    HelloAck(MediaKeySet),
    Rekey(MediaKeySet),
    CaptureState {
        kind: MediaKind,
        on: bool,
    },
    AppData(Vec<u8>),
}

impl P2pMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::HelloAck(_) => "HelloAck",
            Self::Rekey(_) => "Rekey",
            Self::CaptureState { .. } => "CaptureState",
            Self::AppData(_) => "AppData",
        }
    }
}

pub fn decode_sfu_message(bytes: &[u8]) -> Result<SfuMessage, GroupCallError> {
    let envelope = proto::SfuToParticipant::decode(bytes)?;
    Ok(
        match envelope
            .message
            .ok_or_else(|| GroupCallError::bad_message("empty SFU envelope"))?
        {
            from_sfu::Message::Relay(env) => SfuMessage::Relay(env.into()),
            from_sfu::Message::Hello(hello) => SfuMessage::Hello(
                hello.participant_ids.into_iter().map(ParticipantId).collect(),
            ),
            from_sfu::Message::ParticipantJoined(joined) => {
                SfuMessage::ParticipantJoined(ParticipantId(joined.participant_id))
            }
            from_sfu::Message::ParticipantLeft(left) => {
                SfuMessage::ParticipantLeft(ParticipantId(left.participant_id))
            }
        },
    )
}

pub fn encode_sfu_message(message: &SfuMessage) -> Vec<u8> {
    let message = match message {
        SfuMessage::Relay(env) => from_sfu::Message::Relay(env.into()),
        SfuMessage::Hello(ids) => from_sfu::Message::Hello(from_sfu::Hello {
            participant_ids: ids.iter().map(|id| id.get()).collect(),
        }),
        SfuMessage::ParticipantJoined(id) => {
            from_sfu::Message::ParticipantJoined(from_sfu::ParticipantJoined {
                participant_id: id.get(),
            })
        }
        SfuMessage::ParticipantLeft(id) => {
            from_sfu::Message::ParticipantLeft(from_sfu::ParticipantLeft {
                participant_id: id.get(),
            })
        }
    };
    proto::SfuToParticipant {
        message: Some(message),
    }
    .encode_to_vec()
}

pub fn encode_sfu_request(request: &SfuRequest, padding: Vec<u8>) -> Vec<u8> {
    let message = match request {
        SfuRequest::Relay(env) => to_sfu::Message::Relay(env.into()),
        SfuRequest::UpdateCallState(state) => {
            to_sfu::Message::UpdateCallState(to_sfu::UpdateCallState {
                encrypted_call_state: state.clone(),
            })
        }
        SfuRequest::RequestVideo {
            participant,
            subscribe,
        } => to_sfu::Message::RequestVideo(to_sfu::RequestVideo {
            participant_id: participant.get(),
            subscribe: *subscribe,
        }),
        SfuRequest::Leave => to_sfu::Message::Leave(to_sfu::Leave {}),
    };
    proto::ParticipantToSfu {
        padding,
        message: Some(message),
    }
    .encode_to_vec()
}

pub fn decode_sfu_request(bytes: &[u8]) -> Result<SfuRequest, GroupCallError> {
    let envelope = proto::ParticipantToSfu::decode(bytes)?;
    Ok(
        match envelope
            .message
            .ok_or_else(|| GroupCallError::bad_message("empty SFU request"))?
        {
            to_sfu::Message::Relay(env) => SfuRequest::Relay(env.into()),
            to_sfu::Message::UpdateCallState(update) => {
                SfuRequest::UpdateCallState(update.encrypted_call_state)
            }
            to_sfu::Message::RequestVideo(request) => SfuRequest::RequestVideo {
                participant: ParticipantId(request.participant_id),
                subscribe: request.subscribe,
            },
            to_sfu::Message::Leave(_) => SfuRequest::Leave,
        },
    )
}

fn media_key_to_proto(key_set: &MediaKeySet) -> proto::MediaKey {
    proto::MediaKey {
        epoch: key_set.epoch(),
        key: key_set.key().to_vec(),
    }
}

fn media_key_from_proto(key: Option<proto::MediaKey>) -> Result<MediaKeySet, GroupCallError> {
    let key = key.ok_or_else(|| GroupCallError::bad_message("missing media key"))?;
    MediaKeySet::from_slice(key.epoch, &key.key)
}

pub fn encode_p2p(message: &P2pMessage, padding: Vec<u8>) -> Vec<u8> {
    let message = match message {
        P2pMessage::Hello {
            identity,
            public_key,
        } => p2p::Message::Hello(p2p::Hello {
            identity: identity.clone(),
            public_key: public_key.to_vec(),
        }),
        P2pMessage::HelloAck(key_set) => p2p::Message::HelloAck(p2p::HelloAck {
            media_key: Some(media_key_to_proto(key_set)),
        }),
        P2pMessage::Rekey(key_set) => p2p::Message::Rekey(p2p::Rekey {
            media_key: Some(media_key_to_proto(key_set)),
        }),
        P2pMessage::CaptureState { kind, on } => {
            let device = match kind {
                MediaKind::Audio => p2p::CaptureDevice::Microphone,
                MediaKind::Video => p2p::CaptureDevice::Camera,
            };
            p2p::Message::CaptureState(p2p::CaptureState {
                device: device as i32,
                on: *on,
            })
        }
        P2pMessage::AppData(data) => p2p::Message::AppData(p2p::AppData { data: data.clone() }),
    };
    proto::ParticipantToParticipant {
        padding,
        message: Some(message),
    }
    .encode_to_vec()
}

pub fn decode_p2p(bytes: &[u8]) -> Result<P2pMessage, GroupCallError> {
    let envelope = proto::ParticipantToParticipant::decode(bytes)?;
    Ok(
        match envelope
            .message
            .ok_or_else(|| GroupCallError::bad_message("empty participant envelope"))?
        {
            p2p::Message::Hello(hello) => P2pMessage::Hello {
                identity: hello.identity,
                public_key: hello
                    .public_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| GroupCallError::bad_message("bad public key length"))?,
            },
            p2p::Message::HelloAck(ack) => P2pMessage::HelloAck(media_key_from_proto(ack.media_key)?),
            p2p::Message::Rekey(rekey) => P2pMessage::Rekey(media_key_from_proto(rekey.media_key)?),
            p2p::Message::CaptureState(state) => {
                let kind = match p2p::CaptureDevice::try_from(state.device) {
                    Ok(p2p::CaptureDevice::Microphone) => MediaKind::Audio,
                    Ok(p2p::CaptureDevice::Camera) => MediaKind::Video,
                    Err(_) => {
                        return Err(GroupCallError::BadMessage(format!(
                            "unknown capture device {}",
                            state.device
                        )));
                    }
                };
                P2pMessage::CaptureState { kind, on: state.on }
            }
            p2p::Message::AppData(app) => P2pMessage::AppData(app.data),
        },
    )
}

/// Encodes, pads and encrypts a participant message.
pub fn seal_p2p(
    crypto: &dyn CallCrypto,
    key: &[u8; KEY_LEN],
    message: &P2pMessage,
) -> Result<Vec<u8>, GroupCallError> {
    crypto.seal(key, &encode_p2p(message, crypto.padding()))
}

pub fn open_p2p(
    crypto: &dyn CallCrypto,
    key: &[u8; KEY_LEN],
    sealed: &[u8],
) -> Result<P2pMessage, GroupCallError> {
    decode_p2p(&crypto.open(key, sealed)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStateParticipant {
    pub id: ParticipantId,
    pub identity: String,
}

/// Decrypted call state, as published by the participant with the lowest id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStateSnapshot {
    pub created_by: String,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    pub participants: Vec<CallStateParticipant>,
}

pub fn encrypt_call_state(
    crypto: &dyn CallCrypto,
    keys: &GroupCallKeys,
    state: &CallStateSnapshot,
) -> Result<Vec<u8>, GroupCallError> {
    let message = proto::CallState {
        padding: crypto.padding(),
        created_by: state.created_by.clone(),
        created_at: state.created_at,
        participants: state
            .participants
            .iter()
            .map(|p| proto::call_state::Participant {
                participant_id: p.id.get(),
                identity: p.identity.clone(),
            })
            .collect(),
    };
    crypto.seal(keys.gcsk(), &message.encode_to_vec())
}

pub fn decrypt_call_state(
    crypto: &dyn CallCrypto,
    keys: &GroupCallKeys,
    sealed: &[u8],
) -> Result<CallStateSnapshot, GroupCallError> {
    let state = proto::CallState::decode(crypto.open(keys.gcsk(), sealed)?.as_slice())?;
    Ok(CallStateSnapshot {
        created_by: state.created_by,
        created_at: state.created_at,
        participants: state
            .participants
            .into_iter()
            .map(|p| CallStateParticipant {
                id: ParticipantId(p.participant_id),
                identity: p.identity,
            })
            .collect(),
    })
}
