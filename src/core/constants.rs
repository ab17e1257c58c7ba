//! Protocol constants for the obfuscated framed transport.
//!
//! Wire-format values are fixed by the protocol and MUST NOT be changed.

// =============================================================================
// OBFUSCATION HANDSHAKE
// =============================================================================

/// Size of the handshake prelude sent as the first bytes of every TCP
/// session.
pub const PRELUDE_SIZE: usize = 64;

/// Offset of the protocol marker inside the prelude.
pub const PRELUDE_MARKER_OFFSET: usize = 56;

/// Marker byte identifying the obfuscated-EF framing variant.
pub const PROTOCOL_MARKER_EF: u8 = 0xef;

/// First-u32 values (little-endian) the prelude generator must never emit.
///
/// These are the plaintext signatures of other protocols that may share the
/// port (HTTP verbs, the legacy framing variants); a prelude starting with
/// one of them would identify the stream.
pub const FORBIDDEN_PRELUDE_WORDS: [u32; 7] = [
    0x44414548, // "HEAD"
    0x54534f50, // "POST"
    0x20544547, // "GET "
    0x4954504f, // "OPTI"
    0xeeeeeeee,
    0xdddddddd,
    0x02010316,
];

// =============================================================================
// FRAMING
// =============================================================================

/// Largest frame payload accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Length-byte value that switches the prefix to the 4-byte long form.
pub const LONG_FORM_MARKER: u8 = 0x7f;

/// High bit of the length byte: ack-request on outbound frames, quick-ack
/// on inbound ones.
pub const ACK_FLAG: u8 = 0x80;

// =============================================================================
// SOCKET DRIVER
// =============================================================================

/// Size of the shared scratch buffer the read/write pumps go through.
pub const READ_BUFFER_SIZE: usize = 2 * 1024 * 1024;

// =============================================================================
// TIMEOUTS (seconds)
// =============================================================================

/// Initial adaptive idle timeout for generic-class connections.
pub const DEFAULT_CONNECTION_TIMEOUT: u32 = 12;

/// Floor of the adaptive idle timeout.
pub const MIN_CONNECTION_TIMEOUT: u32 = 6;

/// Ceiling of the adaptive idle timeout.
pub const MAX_CONNECTION_TIMEOUT: u32 = 16;

/// Received bytes per adaptive-timeout decrement step.
pub const ADAPTIVE_TIMEOUT_WINDOW: usize = 512 * 1024;

// =============================================================================
// RECONNECT BACKOFF (milliseconds)
// =============================================================================

/// Initial reconnect delay for refused/unreachable error classes.
pub const RECONNECT_TIMEOUT_MIN_MS: i64 = 50;

/// Reconnect delay ceiling.
pub const RECONNECT_TIMEOUT_MAX_MS: i64 = 400;

/// Reconnect delay when retrying the home or in-handshake datacenter.
pub const RECONNECT_TIMEOUT_DEFAULT_MS: i64 = 1000;

/// Errno values that trigger exponential reconnect backoff
/// (host-unreachable / connection-refused family).
pub const BACKOFF_ERRNO: [i32; 2] = [0x68, 0x71];

// =============================================================================
// USEFUL-DATA TRACKING
// =============================================================================

/// A connection's useful-data flag only counts once it has been set for
/// this long (milliseconds); inside the window the flag is ignored.
pub const USEFUL_DATA_STABILIZATION_MS: i64 = 4 * 1000;
