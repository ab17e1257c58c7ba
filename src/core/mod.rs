//! Core constants, errors, types, and environment traits.

pub mod constants;
mod error;
mod traits;
mod types;

pub use constants::*;
pub use error::{FrameError, SocketError};
pub use traits::{ConnectionDelegate, Datacenter};
pub use types::{
    AddressFlags, ConnectionHandle, ConnectionStage, ConnectionType, DisconnectReason, IpStrategy,
    TcpAddress,
};
