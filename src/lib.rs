//! # obfnet
//!
//! Obfuscated framed TCP transport for messenger datacenter connections.
//!
//! Each [`Connection`] is one TCP session to a datacenter endpoint that
//! carries framed application messages inside a stream-cipher obfuscation
//! layer:
//!
//! - **Obfuscation**: a 64-byte random prelude opens every session and
//!   derives two continuous AES-256-CTR streams; nothing on the wire is
//!   distinguishable from noise.
//! - **Framing**: variable-length frames with an encrypted length prefix,
//!   reassembled across reads, plus 4-byte quick-ack control frames.
//! - **Resilience**: address/port rotation on repeated failure, IPv4/IPv6
//!   strategy selection, adaptive idle timeouts, and exponential backoff
//!   for refused/unreachable endpoints.
//!
//! The crate brings no runtime of its own. The host owns the `mio` poll
//! loop, a 1 Hz timer, the datacenter address registry, and the upward
//! delegate; everything is lent to a connection per call through
//! [`NetContext`]. All connections of a runtime instance live on one
//! thread.
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, shared types, and the environment traits
//! - [`crypto`]: prelude handshake and the paired cipher streams
//! - [`transport`]: byte stream, frame codec, socket driver, connection
//! - [`buffer`]: the reusable buffer pool
//!
//! ## Driving a connection
//!
//! ```ignore
//! let mut conn = Connection::new(ConnectionType::Generic, 0, Token(1));
//! conn.connect(&mut ctx);
//! loop {
//!     poll.poll(&mut events, Some(tick))?;
//!     for event in events.iter() {
//!         conn.on_ready(&mut ctx, event);
//!     }
//!     conn.check_timeout(&mut ctx); // 1 Hz
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod core;
pub mod crypto;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::buffer::{BufferPool, PooledBuffer};
    pub use crate::core::{
        AddressFlags, ConnectionDelegate, ConnectionHandle, ConnectionStage, ConnectionType,
        Datacenter, DisconnectReason, FrameError, IpStrategy, SocketError, TcpAddress,
    };
    pub use crate::crypto::ObfuscationCipher;
    pub use crate::transport::{Connection, NetContext};
}

pub use buffer::{BufferPool, PooledBuffer};
pub use core::{
    AddressFlags, ConnectionDelegate, ConnectionHandle, ConnectionStage, ConnectionType,
    Datacenter, DisconnectReason, IpStrategy, TcpAddress,
};
pub use crypto::ObfuscationCipher;
pub use transport::{Connection, NetContext};
