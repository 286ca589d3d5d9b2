//! Group call sessions over an SFU.
//!
//! # Architecture
//!
//! - [`GroupCallManager`]: tracks announced calls per group, peeks them and
//!   owns the single active session
//! - [`GroupCall`] / [`GroupCallHandle`]: spawns a session task and controls it
//! - [`GroupCallSession`]: the state machine driven by that task
//! - [`SfuClient`]: peek and join requests against the SFU HTTP API
//!
//! Observers subscribe to [`GroupCallEvent`]s through the handle; the latest
//! phase and participant count are also readable without subscribing.

mod actor;
mod connected;
mod context;
mod error;
mod events;
mod manager;
mod sfu;
mod state;

pub use actor::{GroupCall, GroupCallHandle};
pub use context::{ConnectedContext, SessionCommand};
pub use error::CallError;
pub use events::{GroupCallEvent, SessionPhase, SessionSnapshot};
pub use manager::{GroupCallManager, ProposedCall};
pub use sfu::{
    JoinInfo, JoinOutcome, PeekInfo, PeekOutcome, SfuClient, StaticTokenProvider,
    validate_base_url,
};
pub use state::{GroupCallDeps, GroupCallSession, Interrupt, SessionState};
