//! Transport layer: byte stream, frame codec, socket driver, and the
//! connection state machine.
//!
//! - **Byte stream**: [`ByteStream`], the outbound FIFO drained by byte
//!   count.
//! - **Frame codec**: [`FrameAssembler`] and the length-prefix encoder,
//!   reassembling frames across fragmented reads.
//! - **Socket driver**: one non-blocking TCP socket per connection,
//!   pumped by the runtime's readiness loop (internal).
//! - **Connection**: [`Connection`], tying the above to reconnect policy,
//!   address rotation, and adaptive timeouts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       RPC / session layer (host)        │
//! ├─────────────────────────────────────────┤
//! │        Connection state machine         │  ← this module
//! │   frame codec ─ obfuscation cipher      │
//! │   byte stream ─ socket driver           │
//! ├─────────────────────────────────────────┤
//! │     readiness loop (mio, host-owned)    │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod frame;
mod socket;
mod stream;
mod timing;

pub use connection::{Connection, NetContext};
pub use frame::{encode_length_prefix, FrameAssembler, FrameEvent};
pub use stream::ByteStream;
pub use timing::{AdaptiveTimeout, ReconnectBackoff};
