use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::GroupCallError;

pub const GCK_LEN: usize = 32;
pub const GROUP_ID_LEN: usize = 8;

/// Participant id assigned by the SFU. Only unique within one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ParticipantId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A group as seen by the call layer: who created it plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupIdentity {
    pub creator: String,
    pub group_id: [u8; GROUP_ID_LEN],
}

impl GroupIdentity {
    pub fn new(creator: impl Into<String>, group_id: [u8; GROUP_ID_LEN]) -> Self {
        Self {
            creator: creator.into(),
            group_id,
        }
    }
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.creator, hex::encode(self.group_id))
    }
}

/// Group call key: the shared secret announced to the group.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupCallKey([u8; GCK_LEN]);

impl GroupCallKey {
    pub fn from_bytes(bytes: [u8; GCK_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, GroupCallError> {
        let key: [u8; GCK_LEN] = bytes.try_into().map_err(|_| {
            GroupCallError::LocalProtocolViolation(format!(
                "group call key must be {GCK_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; GCK_LEN] {
        &self.0
    }
}

impl fmt::Debug for GroupCallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupCallKey(..)")
    }
}

/// Announcement payload that lets group members find and join a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStartData {
    pub protocol_version: u32,
    pub gck: GroupCallKey,
    pub sfu_base_url: String,
}

/// Identifier of one logical call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId([u8; 32]);

impl CallId {
    const LABEL: &'static [u8] = b"group-call-id";

    /// Derive the id from the group and the start data.
    pub fn derive(group: &GroupIdentity, start: &CallStartData) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Self::LABEL);
        hasher.update(group.creator.as_bytes());
        hasher.update(group.group_id);
        hasher.update(start.protocol_version.to_le_bytes());
        hasher.update(start.gck.as_bytes());
        hasher.update(start.sfu_base_url.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    pub fn log_id(&self) -> String {
        hex::encode(&self.0[..3])
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.to_hex())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Everything that identifies a call. Fixed for the whole life of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallIdentity {
    pub group: GroupIdentity,
    pub sfu_base_url: String,
    pub protocol_version: u32,
    call_key: GroupCallKey,
    call_id: CallId,
}

impl CallIdentity {
    pub fn new(group: GroupIdentity, start: CallStartData) -> Self {
        let call_id = CallId::derive(&group, &start);
        Self {
            group,
            sfu_base_url: start.sfu_base_url,
            protocol_version: start.protocol_version,
            call_key: start.gck,
            call_id,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn call_key(&self) -> &GroupCallKey {
        &self.call_key
    }

    pub fn start_data(&self) -> CallStartData {
        CallStartData {
            protocol_version: self.protocol_version,
            gck: self.call_key.clone(),
            sfu_base_url: self.sfu_base_url.clone(),
        }
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Why a session ended. Expected terminations are kept apart from failures so
/// the UI can tell "call ended" from "call failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Somebody else ended the call before we got in (SFU answered 404).
    EndedInMeantime,
    /// The local user asked to leave.
    LocalLeave,
    /// Interrupted by a forced leave (hang-up or orchestrator teardown).
    ForcedLeave,
    /// The peer connection went away.
    Disconnected,
    Failed(GroupCallError),
}

impl EndReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&GroupCallError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GroupCallError> for EndReason {
    fn from(err: GroupCallError) -> Self {
        Self::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(url: &str) -> CallStartData {
        CallStartData {
            protocol_version: 1,
            gck: GroupCallKey::from_bytes([7; GCK_LEN]),
            sfu_base_url: url.to_string(),
        }
    }

    #[test]
    fn call_id_depends_on_every_input() {
        let group = GroupIdentity::new("ECHOECHO", [1; GROUP_ID_LEN]);
        let a = CallId::derive(&group, &start("https://sfu.example.com"));
        let b = CallId::derive(&group, &start("https://sfu.example.com"));
        let c = CallId::derive(&group, &start("https://other.example.com"));
        let other_group = GroupIdentity::new("ECHOECHO", [2; GROUP_ID_LEN]);
        let d = CallId::derive(&other_group, &start("https://sfu.example.com"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.log_id().len(), 6);
    }

    #[test]
    fn gck_length_is_checked() {
        assert!(GroupCallKey::from_slice(&[0u8; 31]).is_err());
        assert!(GroupCallKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn end_reason_failure() {
        assert!(!EndReason::EndedInMeantime.is_failure());
        let failed = EndReason::from(GroupCallError::InvalidToken);
        assert_eq!(failed.error(), Some(&GroupCallError::InvalidToken));
    }
}
