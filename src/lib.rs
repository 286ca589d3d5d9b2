pub use gccore::{ErrorClass, GroupCallError, codec, crypto, frame, handshake, keys, net, registry, types};

pub mod config;
pub mod group_call;

pub use config::{GroupCallConfig, ManagerConfig};
pub use group_call::{
    CallError, GroupCall, GroupCallDeps, GroupCallEvent, GroupCallHandle, GroupCallManager,
    SessionPhase,
};
