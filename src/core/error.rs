//! Error types for the obfuscated transport.

use thiserror::Error;

/// Errors raised while parsing the inbound frame stream.
///
/// Frame errors never surface to the upper layer; the connection absorbs
/// them into a silent `reconnect()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame length is zero, not a multiple of four, or above the 2 MiB cap.
    #[error("invalid frame length {0}")]
    InvalidLength(usize),
}

/// Errors raised while opening or driving the socket.
///
/// These are absorbed at the connection boundary and surfaced as an
/// `on_connection_closed(reason)` callback; they exist as a type for
/// logging and for the driver's internal plumbing.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The address string is not a numeric IP of the requested family.
    #[error("bad address {0}")]
    BadAddress(String),

    /// A socket syscall failed.
    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl SocketError {
    /// The raw OS error code carried by this error, or -1 when there is
    /// none.
    pub fn os_error(&self) -> i32 {
        match self {
            SocketError::BadAddress(_) => -1,
            SocketError::Io(err) => err.raw_os_error().unwrap_or(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_defaults_to_minus_one() {
        let err = SocketError::BadAddress("nope".into());
        assert_eq!(err.os_error(), -1);

        let err = SocketError::from(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(err.os_error(), -1);
    }

    #[test]
    fn test_os_error_passes_errno_through() {
        let err = SocketError::from(std::io::Error::from_raw_os_error(0x68));
        assert_eq!(err.os_error(), 0x68);
    }
}
