//! Error taxonomy for group calls.
//!
//! Every failure that can end a session is one [`GroupCallError`] variant. The
//! classification into fatal and non-fatal lives here and nowhere else: the
//! session maps errors to a termination reason by asking the error itself.

use thiserror::Error;

/// Broad family of a [`GroupCallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Wire or state violations by us, a peer, or the SFU.
    Protocol,
    /// Key ratchet or frame authentication problems.
    Crypto,
    /// The call could not be started.
    Join,
    /// Reported to the UI, the call keeps running.
    NonFatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupCallError {
    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("local protocol violation: {0}")]
    LocalProtocolViolation(String),

    #[error("remote protocol violation: {0}")]
    RemoteProtocolViolation(String),

    #[error("SFU protocol violation: {0}")]
    SfuProtocolViolation(String),

    #[error("participant {0} is in a bad state")]
    BadParticipantState(u32),

    #[error("key ratchet error: {0}")]
    KeyRatchetError(String),

    #[error("frame authentication failed for participant {0}")]
    FrameCryptoFailure(u32),

    #[error("encryption failure")]
    EncryptionFailure,

    #[error("could not join call: {0}")]
    JoinError(String),

    #[error("could not create peer connection: {0}")]
    CreationError(String),

    #[error("invalid SFU base URL: {0}")]
    InvalidSfuBaseUrl(String),

    #[error("invalid SFU token")]
    InvalidToken,

    #[error("capture error: {0}")]
    CaptureError(String),
}

impl GroupCallError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadMessage(_)
            | Self::SerializationFailure(_)
            | Self::LocalProtocolViolation(_)
            | Self::RemoteProtocolViolation(_)
            | Self::SfuProtocolViolation(_)
            | Self::BadParticipantState(_) => ErrorClass::Protocol,
            Self::KeyRatchetError(_) | Self::FrameCryptoFailure(_) | Self::EncryptionFailure => {
                ErrorClass::Crypto
            }
            Self::JoinError(_)
            | Self::CreationError(_)
            | Self::InvalidSfuBaseUrl(_)
            | Self::InvalidToken => ErrorClass::Join,
            Self::CaptureError(_) => ErrorClass::NonFatal,
        }
    }

    /// Whether the session has to end because of this error.
    pub fn is_fatal(&self) -> bool {
        self.class() != ErrorClass::NonFatal
    }

    pub(crate) fn bad_message(err: impl std::fmt::Display) -> Self {
        Self::BadMessage(err.to_string())
    }
}

impl From<prost::DecodeError> for GroupCallError {
    fn from(err: prost::DecodeError) -> Self {
        Self::bad_message(err)
    }
}

impl From<prost::EncodeError> for GroupCallError {
    fn from(err: prost::EncodeError) -> Self {
        Self::SerializationFailure(err.to_string())
    }
}
