pub mod codec;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod keys;
pub mod net;
pub mod proto;
pub mod registry;
pub mod types;

pub use error::{ErrorClass, GroupCallError};
