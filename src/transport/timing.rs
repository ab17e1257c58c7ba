//! Timeout adaptation and reconnect backoff policies.

use crate::core::{
    ADAPTIVE_TIMEOUT_WINDOW, DEFAULT_CONNECTION_TIMEOUT, MAX_CONNECTION_TIMEOUT,
    MIN_CONNECTION_TIMEOUT, RECONNECT_TIMEOUT_MAX_MS, RECONNECT_TIMEOUT_MIN_MS,
};

/// Idle-timeout adaptation for generic-class connections.
///
/// A connection that keeps receiving data earns a tighter idle timeout
/// (2 s per 512 KiB, down to 6 s); one that times out after a successful
/// connect gets a wider one (up to 16 s).
#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    current: u32,
    received: usize,
}

impl AdaptiveTimeout {
    /// Start at the default 12 s timeout.
    pub fn new() -> Self {
        Self {
            current: DEFAULT_CONNECTION_TIMEOUT,
            received: 0,
        }
    }

    /// Current timeout in seconds.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Account for `len` received bytes.
    ///
    /// Returns the new timeout when a full window was crossed and the
    /// timeout tightened.
    pub fn on_data_received(&mut self, len: usize) -> Option<u32> {
        self.received += len;
        if self.received < ADAPTIVE_TIMEOUT_WINDOW {
            return None;
        }
        self.received = 0;
        if self.current > MIN_CONNECTION_TIMEOUT {
            self.current -= 2;
            Some(self.current)
        } else {
            None
        }
    }

    /// Widen the timeout after an idle-timeout disconnect.
    pub fn widen(&mut self) {
        if self.current < MAX_CONNECTION_TIMEOUT {
            self.current += 2;
        }
    }

    /// Restart the received-byte window (on disconnect).
    pub fn reset_window(&mut self) {
        self.received = 0;
    }
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential delay for reconnects after refused/unreachable errors.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    delay_ms: i64,
}

impl ReconnectBackoff {
    /// Start at the 50 ms minimum.
    pub fn new() -> Self {
        Self {
            delay_ms: RECONNECT_TIMEOUT_MIN_MS,
        }
    }

    /// The delay to arm now; doubles the next one, capped at 400 ms.
    pub fn next_delay(&mut self) -> i64 {
        let delay = self.delay_ms;
        self.delay_ms = (self.delay_ms * 2).min(RECONNECT_TIMEOUT_MAX_MS);
        delay
    }

    /// Drop back to the minimum (the connection proved useful).
    pub fn reset(&mut self) {
        self.delay_ms = RECONNECT_TIMEOUT_MIN_MS;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}
