//! Errors of the call control surface (handle and manager).

use gccore::GroupCallError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("the call session has ended")]
    SessionEnded,

    #[error("already in a call")]
    AlreadyInCall,

    #[error("no call known for group {0}")]
    NoCallForGroup(String),

    #[error(transparent)]
    Call(#[from] GroupCallError),
}
