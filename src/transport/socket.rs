//! Non-blocking TCP socket driver.
//!
//! Owns one `mio` TCP stream and one token slot in the hosting runtime's
//! readiness registry. The driver pumps bytes between the kernel and the
//! outgoing byte stream, reports what happened as [`SocketEvent`]s, and
//! enforces the idle timeout on the 1 Hz tick. It knows nothing about
//! framing or encryption; the connection layer above interprets the
//! events.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::core::{DisconnectReason, SocketError, DEFAULT_CONNECTION_TIMEOUT};
use crate::transport::stream::ByteStream;

/// What the driver observed while pumping the socket.
///
/// Events are delivered in observation order; `Connected` always precedes
/// the first `Data` of a session, and `Closed` is the last event of one.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// First writable readiness: the TCP connect completed.
    Connected,
    /// One chunk read from the kernel.
    Data(PooledBuffer),
    /// The kernel accepted this many outbound bytes.
    Sent(usize),
    /// The socket is gone; `error` is the raw OS code or -1.
    Closed {
        reason: DisconnectReason,
        error: i32,
    },
}

/// Outcome of an [`SocketDriver::open_connection`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OpenOutcome {
    /// Connect initiated; readiness events will follow.
    Connecting,
    /// The address is a hostname; the driver parked the open until
    /// `on_host_name_resolved` delivers a numeric address.
    ResolveHost,
    /// The open failed synchronously; a `Closed` event was pushed.
    Failed,
}

pub(crate) struct SocketDriver {
    stream: Option<TcpStream>,
    token: Token,
    outgoing: ByteStream,
    /// Idle timeout in seconds; 0 disables the check.
    timeout_secs: i64,
    last_event_time: i64,
    on_connected_sent: bool,
    network_type: i32,
    current_port: u16,
    waiting_for_host_resolve: Option<String>,
    adjust_write_after_resolve: bool,
    /// Endpoint secret, reserved for framing variants that mix it into
    /// the handshake.
    #[allow(dead_code)]
    secret: String,
}

impl SocketDriver {
    pub(crate) fn new(token: Token) -> Self {
        Self {
            stream: None,
            token,
            outgoing: ByteStream::new(),
            timeout_secs: DEFAULT_CONNECTION_TIMEOUT as i64,
            last_event_time: 0,
            on_connected_sent: false,
            network_type: 0,
            current_port: 0,
            waiting_for_host_resolve: None,
            adjust_write_after_resolve: false,
            secret: String::new(),
        }
    }

    /// Resolve `address`, open a non-blocking TCP connect to it, and
    /// register for readiness events.
    ///
    /// Numeric addresses connect immediately; anything else is handed to
    /// the external resolver and completed by
    /// [`on_host_name_resolved`](Self::on_host_name_resolved).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open_connection(
        &mut self,
        address: &str,
        port: u16,
        secret: &str,
        ipv6: bool,
        network_type: i32,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) -> OpenOutcome {
        self.network_type = network_type;
        self.current_port = port;
        self.secret = secret.to_owned();
        self.waiting_for_host_resolve = None;
        self.adjust_write_after_resolve = false;
        self.last_event_time = now_ms;

        let parsed: Option<IpAddr> = if ipv6 {
            address.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
        } else {
            address.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
        };
        match parsed {
            Some(ip) => {
                if self.start_connect(ip, registry, now_ms, events) {
                    OpenOutcome::Connecting
                } else {
                    OpenOutcome::Failed
                }
            }
            None if !address.is_empty() && address.bytes().any(|b| b.is_ascii_alphabetic()) => {
                self.waiting_for_host_resolve = Some(address.to_owned());
                OpenOutcome::ResolveHost
            }
            None => {
                let err = SocketError::BadAddress(address.to_owned());
                warn!(%err, ipv6, "cannot open connection");
                self.close_socket(
                    DisconnectReason::Failure,
                    err.os_error(),
                    registry,
                    now_ms,
                    events,
                );
                OpenOutcome::Failed
            }
        }
    }

    /// Completion callback for a parked hostname open.
    ///
    /// Must be invoked on the runtime thread. Ignored unless `host`
    /// matches the pending resolution.
    pub(crate) fn on_host_name_resolved(
        &mut self,
        host: &str,
        ip: &str,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        if self.waiting_for_host_resolve.as_deref() != Some(host) {
            return;
        }
        self.waiting_for_host_resolve = None;
        match ip.parse::<IpAddr>() {
            Ok(addr) => {
                debug!(host, ip, "resolved connect address");
                self.start_connect(addr, registry, now_ms, events);
            }
            Err(_) => {
                warn!(host, "host resolution failed");
                self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
            }
        }
    }

    fn start_connect(
        &mut self,
        ip: IpAddr,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        let addr = SocketAddr::new(ip, self.current_port);
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%addr, %err, "tcp connect failed");
                self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
                return false;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%err, "set TCP_NODELAY failed");
        }
        if let Err(err) = registry.register(
            &mut stream,
            self.token,
            Interest::READABLE.add(Interest::WRITABLE),
        ) {
            warn!(%err, "registering socket with notifier failed");
            self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
            return false;
        }
        self.stream = Some(stream);
        if self.adjust_write_after_resolve {
            self.adjust_write_op(registry, now_ms, events);
        }
        true
    }

    /// Queue `buf` for sending and make sure writable interest is
    /// registered.
    pub(crate) fn write_buffer(
        &mut self,
        buf: PooledBuffer,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        self.outgoing.append(buf);
        self.adjust_write_op(registry, now_ms, events);
    }

    /// Handle one readiness notification from the runtime loop.
    pub(crate) fn on_ready(
        &mut self,
        registry: &Registry,
        pool: &BufferPool,
        scratch: &mut [u8],
        readable: bool,
        writable: bool,
        peer_closed: bool,
        had_error: bool,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        if self.stream.is_none() {
            return;
        }
        // Announce the connect before draining any coalesced inbound
        // data, so Connected always precedes the first Data.
        if writable && !self.announce_connect(registry, now_ms, events) {
            return;
        }
        if readable && !self.pump_read(registry, pool, scratch, now_ms, events) {
            return;
        }
        if writable && !self.pump_write(registry, scratch, now_ms, events) {
            return;
        }
        if peer_closed {
            debug!("peer closed the socket");
            self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
            return;
        }
        if had_error {
            // The error surfaces through SO_ERROR on the next read or
            // write readiness.
            warn!("socket readiness reported an error condition");
        }
    }

    /// Read until the kernel runs dry. Returns false when the socket was
    /// closed.
    fn pump_read(
        &mut self,
        registry: &Registry,
        pool: &BufferPool,
        scratch: &mut [u8],
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        if let Some(error) = self.take_socket_error() {
            self.close_socket(DisconnectReason::Failure, error, registry, now_ms, events);
            return false;
        }
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return true;
            };
            match stream.read(scratch) {
                Ok(0) => {
                    debug!("read returned end of stream");
                    self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
                    return false;
                }
                Ok(count) => {
                    self.last_event_time = now_ms;
                    events.push(SocketEvent::Data(pool.take_from(&scratch[..count])));
                    if count < scratch.len() {
                        return true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "recv failed");
                    self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
                    return false;
                }
            }
        }
    }

    /// Check writable readiness for a connect error and report the
    /// connect exactly once. Returns false when the socket was closed.
    fn announce_connect(
        &mut self,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        if let Some(error) = self.take_socket_error() {
            self.close_socket(DisconnectReason::Failure, error, registry, now_ms, events);
            return false;
        }
        if !self.on_connected_sent {
            self.last_event_time = now_ms;
            self.on_connected_sent = true;
            events.push(SocketEvent::Connected);
        }
        true
    }

    /// Drain what the kernel will take from the outgoing stream.
    /// Returns false when the socket was closed.
    fn pump_write(
        &mut self,
        registry: &Registry,
        scratch: &mut [u8],
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        let pending = self.outgoing.get(scratch);
        if pending == 0 {
            return true;
        }
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        match stream.write(&scratch[..pending]) {
            Ok(written) => {
                events.push(SocketEvent::Sent(written));
                self.outgoing.discard(written);
                self.adjust_write_op(registry, now_ms, events);
                true
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => {
                warn!(%err, "send failed");
                self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
                false
            }
        }
    }

    /// Re-register with writable interest only while there is something
    /// to write or the connect phase is still pending.
    fn adjust_write_op(
        &mut self,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        if self.waiting_for_host_resolve.is_some() {
            self.adjust_write_after_resolve = true;
            return;
        }
        let want_write = self.outgoing.has_data() || !self.on_connected_sent;
        let interest = if want_write {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        let failed = match self.stream.as_mut() {
            Some(stream) => registry.reregister(stream, self.token, interest).is_err(),
            None => false,
        };
        if failed {
            warn!("adjusting notifier interest failed");
            self.close_socket(DisconnectReason::Failure, -1, registry, now_ms, events);
        }
    }

    // Only SO_ERROR surfaces a real OS code to the layer above;
    // connect/recv/send syscall failures close with -1.
    fn take_socket_error(&mut self) -> Option<i32> {
        let stream = self.stream.as_ref()?;
        match stream.take_error() {
            Ok(None) => None,
            Ok(Some(err)) => {
                warn!(%err, "socket error");
                Some(err.raw_os_error().unwrap_or(-1))
            }
            Err(err) => Some(err.raw_os_error().unwrap_or(-1)),
        }
    }

    /// Detach from the notifier, close the socket, drop queued output,
    /// and report `Closed`.
    pub(crate) fn close_socket(
        &mut self,
        reason: DisconnectReason,
        error: i32,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        self.last_event_time = now_ms;
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
        }
        self.waiting_for_host_resolve = None;
        self.adjust_write_after_resolve = false;
        self.on_connected_sent = false;
        self.outgoing.clean();
        events.push(SocketEvent::Closed { reason, error });
    }

    /// Intentional hard drop (reason 0).
    pub(crate) fn drop_connection(
        &mut self,
        registry: &Registry,
        now_ms: i64,
        events: &mut Vec<SocketEvent>,
    ) {
        self.close_socket(DisconnectReason::Shutdown, 0, registry, now_ms, events);
    }

    /// 1 Hz idle check. Returns true when the socket was closed for
    /// timeout.
    ///
    /// A connection that is past its connect phase and has nothing
    /// pending is merely idle: its clock is reset instead.
    pub(crate) fn check_timeout(
        &mut self,
        now_ms: i64,
        has_pending_requests: bool,
        registry: &Registry,
        events: &mut Vec<SocketEvent>,
    ) -> bool {
        if self.timeout_secs != 0 && now_ms - self.last_event_time > self.timeout_secs * 1000 {
            if !self.on_connected_sent || has_pending_requests {
                self.close_socket(DisconnectReason::Timeout, 0, registry, now_ms, events);
                return true;
            }
            debug!("idle with no pending requests, resetting event time");
            self.last_event_time = now_ms;
        }
        false
    }

    /// Set the idle timeout (seconds; 0 disables) and restart its clock.
    pub(crate) fn set_timeout(&mut self, seconds: u32, now_ms: i64) {
        self.timeout_secs = seconds as i64;
        self.last_event_time = now_ms;
        debug!(seconds, "set socket timeout");
    }

    pub(crate) fn timeout(&self) -> u32 {
        self.timeout_secs as u32
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.stream.is_none()
    }

    /// Whether an open is parked on an external host resolution.
    pub(crate) fn is_waiting_for_resolve(&self) -> bool {
        self.waiting_for_host_resolve.is_some()
    }

    pub(crate) fn network_type(&self) -> i32 {
        self.network_type
    }

    /// TLS fingerprint check hook; this transport variant has none.
    pub(crate) fn has_tls_hash_mismatch(&self) -> bool {
        false
    }
}
