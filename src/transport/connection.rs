//! Connection lifecycle state machine.
//!
//! A `Connection` ties one socket driver and one obfuscation cipher to the
//! reconnect policy of its datacenter link: address and port selection,
//! IPv4/IPv6 strategy, failure counting with port rotation, error-class
//! backoff, and the adaptive idle timeout. Decoded frames and lifecycle
//! events are delivered to the hosting manager through
//! [`ConnectionDelegate`]; addresses come from the [`Datacenter`]
//! registry. Both are lent per call through [`NetContext`] — the
//! connection owns neither.

use std::cell::Cell;

use mio::event::Event;
use mio::{Registry, Token};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::core::{
    AddressFlags, ConnectionDelegate, ConnectionHandle, ConnectionStage, ConnectionType,
    Datacenter, DisconnectReason, IpStrategy, BACKOFF_ERRNO, PRELUDE_SIZE,
    RECONNECT_TIMEOUT_DEFAULT_MS, USEFUL_DATA_STABILIZATION_MS,
};
use crate::crypto::ObfuscationCipher;
use crate::transport::frame::{encode_length_prefix, FrameAssembler, FrameEvent};
use crate::transport::socket::{OpenOutcome, SocketDriver, SocketEvent};
use crate::transport::timing::{AdaptiveTimeout, ReconnectBackoff};

thread_local! {
    // Tokens are unique per runtime thread, which is all the upper layer
    // needs to tell successive TCP sessions apart.
    static LAST_CONNECTION_TOKEN: Cell<u32> = const { Cell::new(1) };
}

fn next_connection_token() -> u32 {
    LAST_CONNECTION_TOKEN.with(|counter| {
        let token = counter.get();
        counter.set(token.wrapping_add(1));
        token
    })
}

/// Everything a connection borrows from its runtime for one call.
pub struct NetContext<'a> {
    /// The hosting manager.
    pub delegate: &'a mut dyn ConnectionDelegate,
    /// Address registry of the datacenter this connection belongs to.
    pub datacenter: &'a mut dyn Datacenter,
    /// Readiness registry of the runtime's poll loop.
    pub registry: &'a Registry,
    /// Shared buffer pool.
    pub pool: &'a BufferPool,
    /// Shared read/write scratch buffer (`READ_BUFFER_SIZE` bytes).
    pub scratch: &'a mut Vec<u8>,
    /// Monotonic time in milliseconds.
    pub now_ms: i64,
}

/// One obfuscated framed transport connection to a datacenter endpoint.
pub struct Connection {
    kind: ConnectionType,
    num: u8,
    stage: ConnectionStage,
    session_id: u64,
    connection_token: u32,

    socket: SocketDriver,
    cipher: Option<ObfuscationCipher>,
    assembler: FrameAssembler,
    first_packet_sent: bool,

    adaptive: AdaptiveTimeout,
    backoff: ReconnectBackoff,

    failed_connection_count: u32,
    will_retry_connect_count: u32,
    useful_data: bool,
    useful_data_receive_time: i64,
    has_some_data_since_last_connect: bool,
    is_trying_next_port: bool,
    force_next_port: bool,
    was_connected: bool,
    is_media_connection: bool,

    current_address_flags: AddressFlags,
    host_address: String,
    host_port: u16,
    secret: String,

    reconnect_at: Option<i64>,
    wait_for_reconnect_timer: bool,
    connect_in_progress: bool,
    deferred_disconnect: Option<(DisconnectReason, i32)>,
}

impl Connection {
    /// Create an idle connection of the given role.
    ///
    /// `token` is the slot this connection's socket occupies in the
    /// runtime's readiness registry.
    pub fn new(kind: ConnectionType, num: u8, token: Token) -> Self {
        Self {
            kind,
            num,
            stage: ConnectionStage::Idle,
            session_id: OsRng.next_u64(),
            connection_token: 0,
            socket: SocketDriver::new(token),
            cipher: None,
            assembler: FrameAssembler::new(),
            first_packet_sent: false,
            adaptive: AdaptiveTimeout::new(),
            backoff: ReconnectBackoff::new(),
            failed_connection_count: 0,
            will_retry_connect_count: 0,
            useful_data: false,
            useful_data_receive_time: 0,
            has_some_data_since_last_connect: false,
            is_trying_next_port: false,
            force_next_port: false,
            was_connected: false,
            is_media_connection: false,
            current_address_flags: AddressFlags::NONE,
            host_address: String::new(),
            host_port: 0,
            secret: String::new(),
            reconnect_at: None,
            wait_for_reconnect_timer: false,
            connect_in_progress: false,
            deferred_disconnect: None,
        }
    }

    /// Identity passed to delegate callbacks.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            kind: self.kind,
            num: self.num,
            token: self.connection_token,
            session_id: self.session_id,
        }
    }

    /// Connection role.
    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    /// Per-type index.
    pub fn num(&self) -> u8 {
        self.num
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> ConnectionStage {
        self.stage
    }

    /// Token of the current TCP session; 0 when not connected.
    pub fn connection_token(&self) -> u32 {
        self.connection_token
    }

    /// Random id of the logical session.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Replace the logical session id with a fresh random one.
    pub fn generate_new_session_id(&mut self) {
        self.session_id = OsRng.next_u64();
    }

    /// Whether the connection sits in the quiescent suspended stage.
    pub fn is_suspended(&self) -> bool {
        self.stage == ConnectionStage::Suspended
    }

    /// Whether no socket is currently open.
    pub fn is_disconnected(&self) -> bool {
        self.socket.is_disconnected()
    }

    /// Whether the current session landed on a download-flagged address.
    pub fn is_media_connection(&self) -> bool {
        self.is_media_connection
    }

    /// The obfuscated-EF framing tolerates arbitrary caller padding, as
    /// long as the total stays a multiple of four.
    pub fn allows_custom_padding(&self) -> bool {
        true
    }

    /// TLS fingerprint check hook; always clean for this variant.
    pub fn has_tls_hash_mismatch(&self) -> bool {
        self.socket.has_tls_hash_mismatch()
    }

    /// Current socket idle timeout in seconds.
    pub fn timeout(&self) -> u32 {
        self.socket.timeout()
    }

    /// Proxy override hook; proxy negotiation is not part of this
    /// transport variant.
    pub fn set_override_proxy(
        &mut self,
        _address: &str,
        _port: u16,
        _username: &str,
        _password: &str,
        _secret: &str,
    ) {
    }

    /// Mark that this session carried meaningful application traffic.
    ///
    /// Idempotent; the first call records the time and resets the
    /// reconnect backoff to its 50 ms minimum.
    pub fn set_has_useful_data(&mut self, now_ms: i64) {
        if !self.useful_data {
            self.useful_data = true;
            self.useful_data_receive_time = now_ms;
            self.backoff.reset();
        }
    }

    /// Whether the useful-data flag is set and has survived its 4 s
    /// stabilization window. Grants extra retries before port rotation.
    pub fn has_useful_data(&self, now_ms: i64) -> bool {
        if self.useful_data
            && (now_ms - self.useful_data_receive_time).abs() < USEFUL_DATA_STABILIZATION_MS
        {
            return false;
        }
        self.useful_data
    }

    /// Open a TCP session towards the datacenter.
    ///
    /// Picks an address according to the connection type and the current
    /// IPv4/IPv6 strategy, then hands it to the socket driver. No-op
    /// while already connecting/connected or while a backoff timer is
    /// pending.
    pub fn connect(&mut self, ctx: &mut NetContext<'_>) {
        if self.wait_for_reconnect_timer {
            return;
        }
        if !ctx.delegate.is_network_available() {
            ctx.delegate
                .on_connection_closed(&self.handle(), DisconnectReason::Shutdown);
            return;
        }
        if matches!(
            self.stage,
            ConnectionStage::Connected | ConnectionStage::Connecting
        ) {
            return;
        }
        self.connect_in_progress = true;
        self.stage = ConnectionStage::Connecting;
        self.is_media_connection = false;

        let mut ipv6 = match ctx.delegate.ip_strategy() {
            IpStrategy::Ipv6Only => AddressFlags::IPV6,
            IpStrategy::Ipv4Ipv6Random => {
                let use_v6 = if ctx.delegate.last_protocol_useful_data() {
                    ctx.delegate.last_protocol_is_ipv6()
                } else {
                    let v6 = OsRng.next_u32() % 3 == 0;
                    ctx.delegate.set_last_protocol_is_ipv6(v6);
                    v6
                };
                if self.kind == ConnectionType::Generic {
                    ctx.delegate.set_last_protocol_useful_data(false);
                }
                if use_v6 {
                    AddressFlags::IPV6
                } else {
                    AddressFlags::NONE
                }
            }
            IpStrategy::Ipv4Only => AddressFlags::NONE,
        };
        let is_static = if self.kind == ConnectionType::Proxy {
            AddressFlags::STATIC
        } else {
            AddressFlags::NONE
        };

        let mut address = None;
        if self.kind.is_media() {
            self.current_address_flags = AddressFlags::DOWNLOAD.with(is_static);
            address = ctx
                .datacenter
                .current_address(self.current_address_flags.with(ipv6));
            if address.is_some() {
                self.is_media_connection = true;
            } else {
                self.current_address_flags = is_static;
                address = ctx
                    .datacenter
                    .current_address(self.current_address_flags.with(ipv6));
            }
            if address.is_none() && ipv6 != AddressFlags::NONE {
                ipv6 = AddressFlags::NONE;
                self.current_address_flags = AddressFlags::DOWNLOAD.with(is_static);
                address = ctx.datacenter.current_address(self.current_address_flags);
                if address.is_some() {
                    self.is_media_connection = true;
                } else {
                    self.current_address_flags = is_static;
                    address = ctx.datacenter.current_address(self.current_address_flags);
                }
            }
        } else if self.kind == ConnectionType::Temp {
            self.current_address_flags = AddressFlags::TEMP;
            address = ctx.datacenter.current_address(self.current_address_flags);
            ipv6 = AddressFlags::NONE;
        } else {
            self.current_address_flags = is_static;
            address = ctx
                .datacenter
                .current_address(self.current_address_flags.with(ipv6));
            if address.is_none() && ipv6 != AddressFlags::NONE {
                ipv6 = AddressFlags::NONE;
                address = ctx.datacenter.current_address(self.current_address_flags);
            }
        }

        match &address {
            Some(addr) => {
                self.host_address = addr.address.clone();
                self.secret = addr.secret.clone();
            }
            None => {
                self.host_address.clear();
                self.secret.clear();
            }
        }
        self.host_port = match (&address, self.kind == ConnectionType::Proxy) {
            (Some(addr), true) => addr.port,
            _ => ctx.datacenter.current_port(self.current_address_flags),
        };

        self.reconnect_at = None;
        debug!(
            kind = ?self.kind,
            num = self.num,
            address = %self.host_address,
            port = self.host_port,
            "connecting"
        );

        self.first_packet_sent = false;
        self.cipher = None;
        self.assembler.reset();
        self.was_connected = false;
        self.has_some_data_since_last_connect = false;

        let use_ipv6 = ipv6 == AddressFlags::IPV6;
        let network_type = ctx.delegate.network_type();
        let mut events = Vec::new();
        let outcome = self.socket.open_connection(
            &self.host_address,
            self.host_port,
            &self.secret,
            use_ipv6,
            network_type,
            ctx.registry,
            ctx.now_ms,
            &mut events,
        );
        if outcome == OpenOutcome::ResolveHost {
            ctx.delegate
                .request_host_resolution(&self.host_address, use_ipv6);
        }

        let connect_timeout = match self.kind {
            ConnectionType::Proxy => 5,
            ConnectionType::Push => {
                if self.is_trying_next_port {
                    20
                } else {
                    30
                }
            }
            ConnectionType::Upload => {
                if ctx.delegate.is_network_slow() {
                    40
                } else {
                    25
                }
            }
            _ => {
                if self.is_trying_next_port {
                    8
                } else {
                    12
                }
            }
        };
        self.socket.set_timeout(connect_timeout, ctx.now_ms);

        self.process_events(ctx, events);
        self.connect_in_progress = false;
        if let Some((reason, error)) = self.deferred_disconnect.take() {
            self.on_disconnected_internal(ctx, reason, error);
        }
    }

    /// Tear the session down.
    ///
    /// With `idle` the connection returns to the idle stage and will
    /// auto-reconnect on the next `send_data`; otherwise it stays
    /// suspended until explicitly reconnected.
    pub fn suspend_connection(&mut self, ctx: &mut NetContext<'_>, idle: bool) {
        self.reconnect_at = None;
        self.wait_for_reconnect_timer = false;
        if matches!(
            self.stage,
            ConnectionStage::Idle | ConnectionStage::Suspended
        ) {
            return;
        }
        debug!(kind = ?self.kind, num = self.num, idle, "suspending connection");
        self.stage = if idle {
            ConnectionStage::Idle
        } else {
            ConnectionStage::Suspended
        };

        let mut events = Vec::new();
        self.socket
            .drop_connection(ctx.registry, ctx.now_ms, &mut events);
        self.process_events(ctx, events);

        ctx.delegate
            .on_connection_closed(&self.handle(), DisconnectReason::Shutdown);
        self.first_packet_sent = false;
        self.cipher = None;
        self.assembler.reset();
        self.connection_token = 0;
        self.was_connected = false;
    }

    /// Synchronous hard abort of the socket (reason 0). The normal
    /// disconnect path runs, but none of the suspend bookkeeping.
    pub fn drop_connection(&mut self, ctx: &mut NetContext<'_>) {
        let mut events = Vec::new();
        self.socket
            .drop_connection(ctx.registry, ctx.now_ms, &mut events);
        self.process_events(ctx, events);
    }

    /// Drop the session and immediately dial again, forcing the next
    /// address/port. Proxy connections only suspend.
    pub fn reconnect(&mut self, ctx: &mut NetContext<'_>) {
        if self.kind == ConnectionType::Proxy {
            self.suspend_connection(ctx, false);
        } else {
            self.force_next_port = true;
            self.suspend_connection(ctx, true);
            self.connect(ctx);
        }
    }

    /// Frame `data` and queue it for sending.
    ///
    /// Reconnects first when idle. The first write of a TCP session is
    /// prefixed with the 64-byte obfuscation prelude; prefix and payload
    /// ride the same continuous cipher stream. `data.len()` must be a
    /// multiple of four (wire-format contract with the caller);
    /// `encrypted` marks payloads the RPC layer already sealed and is
    /// informational at this level.
    pub fn send_data(
        &mut self,
        ctx: &mut NetContext<'_>,
        data: &[u8],
        report_ack: bool,
        encrypted: bool,
    ) {
        if data.is_empty() {
            return;
        }
        debug_assert_eq!(data.len() % 4, 0);
        if matches!(
            self.stage,
            ConnectionStage::Idle | ConnectionStage::Reconnecting | ConnectionStage::Suspended
        ) {
            self.connect(ctx);
        }
        if self.socket.is_disconnected() {
            debug!(kind = ?self.kind, num = self.num, "disconnected, dropping outbound frame");
            return;
        }

        let mut header = ctx.pool.take(PRELUDE_SIZE + 4);
        if !self.first_packet_sent {
            let (cipher, prelude) = ObfuscationCipher::initiator(&mut OsRng);
            self.cipher = Some(cipher);
            header.extend_from_slice(&prelude);
            self.first_packet_sent = true;
        }
        let prefix_start = header.len();
        encode_length_prefix(data.len(), report_ack, &mut header);

        let Some(cipher) = self.cipher.as_mut() else {
            warn!("cipher missing with first packet sent, dropping frame");
            return;
        };
        cipher.encrypt_in_place(&mut header[prefix_start..]);
        let mut payload = ctx.pool.take_from(data);
        cipher.encrypt_in_place(&mut payload[..]);

        debug!(
            len = data.len(),
            report_ack, encrypted, "queueing outbound frame"
        );
        let mut events = Vec::new();
        self.socket
            .write_buffer(header, ctx.registry, ctx.now_ms, &mut events);
        self.socket
            .write_buffer(payload, ctx.registry, ctx.now_ms, &mut events);
        self.process_events(ctx, events);
    }

    /// Readiness notification entry point, called by the runtime loop
    /// when `event.token()` matches this connection's slot.
    pub fn on_ready(&mut self, ctx: &mut NetContext<'_>, event: &Event) {
        self.handle_ready(
            ctx,
            event.is_readable(),
            event.is_writable(),
            event.is_read_closed() || event.is_write_closed(),
            event.is_error(),
        );
    }

    pub(crate) fn handle_ready(
        &mut self,
        ctx: &mut NetContext<'_>,
        readable: bool,
        writable: bool,
        peer_closed: bool,
        had_error: bool,
    ) {
        let mut events = Vec::new();
        self.socket.on_ready(
            ctx.registry,
            ctx.pool,
            &mut ctx.scratch[..],
            readable,
            writable,
            peer_closed,
            had_error,
            ctx.now_ms,
            &mut events,
        );
        self.process_events(ctx, events);
    }

    /// 1 Hz tick: fires a due reconnect timer and enforces the socket
    /// idle timeout. Returns true when the timeout closed the session.
    pub fn check_timeout(&mut self, ctx: &mut NetContext<'_>) -> bool {
        if let Some(deadline) = self.reconnect_at {
            if ctx.now_ms >= deadline {
                self.reconnect_at = None;
                self.wait_for_reconnect_timer = false;
                self.connect(ctx);
            }
        }
        // Only sockets that are open or resolving have an idle clock to
        // enforce; a torn-down connection is ticked for its reconnect
        // timer alone.
        if self.socket.is_disconnected() && !self.socket.is_waiting_for_resolve() {
            return false;
        }
        let handle = self.handle();
        let has_pending = ctx.delegate.has_pending_requests(&handle);
        let mut events = Vec::new();
        let timed_out =
            self.socket
                .check_timeout(ctx.now_ms, has_pending, ctx.registry, &mut events);
        self.process_events(ctx, events);
        timed_out
    }

    /// Completion callback for an asynchronous host resolution, invoked
    /// on the runtime thread by the resolver.
    pub fn on_host_name_resolved(&mut self, ctx: &mut NetContext<'_>, host: &str, ip: &str) {
        let mut events = Vec::new();
        self.socket
            .on_host_name_resolved(host, ip, ctx.registry, ctx.now_ms, &mut events);
        self.process_events(ctx, events);
    }

    fn process_events(&mut self, ctx: &mut NetContext<'_>, events: Vec<SocketEvent>) {
        for event in events {
            match event {
                SocketEvent::Connected => self.on_socket_connected(ctx),
                SocketEvent::Sent(count) => {
                    let network_type = self.socket.network_type();
                    ctx.delegate.on_bytes_sent(count, network_type);
                }
                SocketEvent::Data(mut buf) => {
                    let network_type = self.socket.network_type();
                    ctx.delegate.on_bytes_received(buf.len(), network_type);
                    if !self.handle_received_data(ctx, &mut buf) {
                        // The codec tore the session down; whatever was
                        // read after this chunk belongs to it.
                        return;
                    }
                }
                SocketEvent::Closed { reason, error } => self.on_disconnected(ctx, reason, error),
            }
        }
    }

    fn on_socket_connected(&mut self, ctx: &mut NetContext<'_>) {
        self.stage = ConnectionStage::Connected;
        self.connection_token = next_connection_token();
        self.was_connected = true;
        debug!(
            kind = ?self.kind,
            num = self.num,
            token = self.connection_token,
            address = %self.host_address,
            port = self.host_port,
            "connected"
        );
        ctx.delegate.on_connection_connected(&self.handle());
    }

    /// Decrypt one inbound chunk and deliver the frames it completes.
    /// Returns false when an invalid frame forced a reconnect.
    fn handle_received_data(&mut self, ctx: &mut NetContext<'_>, buf: &mut [u8]) -> bool {
        let Some(cipher) = self.cipher.as_mut() else {
            warn!("inbound data before the handshake prelude, dropping");
            return true;
        };
        cipher.decrypt_in_place(buf);

        self.failed_connection_count = 0;
        if self.kind.has_adaptive_timeout() {
            if let Some(tightened) = self.adaptive.on_data_received(buf.len()) {
                self.socket.set_timeout(tightened, ctx.now_ms);
            }
        }

        if !self.has_some_data_since_last_connect && !buf.is_empty() {
            self.has_some_data_since_last_connect = true;
            ctx.datacenter.store_current_address_and_port();
            self.is_trying_next_port = false;
            let idle_timeout = match self.kind {
                ConnectionType::Proxy => 5,
                ConnectionType::Push => 60 * 15,
                ConnectionType::Upload => {
                    if ctx.delegate.is_network_slow() {
                        40
                    } else {
                        25
                    }
                }
                ConnectionType::Download => 25,
                _ => self.adaptive.current(),
            };
            self.socket.set_timeout(idle_timeout, ctx.now_ms);
        }

        let handle = self.handle();
        let delegate = &mut *ctx.delegate;
        let result = self
            .assembler
            .process(ctx.pool, buf, |event| match event {
                FrameEvent::Data(payload) => {
                    delegate.on_connection_data_received(&handle, payload)
                }
                FrameEvent::QuickAck(ack_id) => {
                    delegate.on_connection_quick_ack_received(&handle, ack_id)
                }
            });
        if let Err(err) = result {
            warn!(%err, kind = ?self.kind, num = self.num, "invalid frame, reconnecting");
            self.reconnect(ctx);
            return false;
        }
        true
    }

    fn on_disconnected(&mut self, ctx: &mut NetContext<'_>, reason: DisconnectReason, error: i32) {
        if self.connect_in_progress {
            // A synchronous failure inside connect(); unwind first.
            self.deferred_disconnect = Some((reason, error));
        } else {
            self.on_disconnected_internal(ctx, reason, error);
        }
    }

    fn on_disconnected_internal(
        &mut self,
        ctx: &mut NetContext<'_>,
        reason: DisconnectReason,
        error: i32,
    ) {
        self.reconnect_at = None;
        self.wait_for_reconnect_timer = false;
        debug!(kind = ?self.kind, num = self.num, ?reason, error, "disconnected");

        let switch_to_next_port = (reason == DisconnectReason::Timeout
            && self.was_connected
            && (!self.has_some_data_since_last_connect
                || ctx.datacenter.is_custom_port(self.current_address_flags)))
            || self.force_next_port;

        if self.kind.has_adaptive_timeout()
            && self.was_connected
            && reason == DisconnectReason::Timeout
        {
            self.adaptive.widen();
        }

        self.first_packet_sent = false;
        self.cipher = None;
        self.assembler.reset();
        self.adaptive.reset_window();
        self.was_connected = false;
        if !matches!(
            self.stage,
            ConnectionStage::Suspended | ConnectionStage::Idle
        ) {
            self.stage = ConnectionStage::Idle;
        }
        ctx.delegate.on_connection_closed(&self.handle(), reason);
        self.connection_token = 0;

        let datacenter_id = ctx.datacenter.datacenter_id();
        if self.stage == ConnectionStage::Idle {
            self.stage = ConnectionStage::Reconnecting;
            self.failed_connection_count += 1;
            if self.failed_connection_count == 1 {
                self.will_retry_connect_count = if self.has_useful_data(ctx.now_ms) { 3 } else { 1 };
            }
            if ctx.delegate.is_network_available() && self.kind != ConnectionType::Proxy {
                self.is_trying_next_port = true;
                if self.failed_connection_count > self.will_retry_connect_count
                    || switch_to_next_port
                {
                    ctx.datacenter.next_address_or_port(self.current_address_flags);
                    if ctx.datacenter.is_repeat_checking_addresses()
                        && matches!(
                            ctx.delegate.ip_strategy(),
                            IpStrategy::Ipv4Only | IpStrategy::Ipv6Only
                        )
                    {
                        debug!("address list wrapped, switching to random family strategy");
                        ctx.delegate.set_ip_strategy(IpStrategy::Ipv4Ipv6Random);
                    }
                    self.failed_connection_count = 0;
                }
            }
            if BACKOFF_ERRNO.contains(&error) {
                if self.kind != ConnectionType::Proxy {
                    self.wait_for_reconnect_timer = true;
                    let delay = self.backoff.next_delay();
                    debug!(delay, "arming reconnect backoff");
                    self.reconnect_at = Some(ctx.now_ms + delay);
                }
            } else {
                let rearm = match self.kind {
                    ConnectionType::GenericMedia => ctx.datacenter.is_handshaking(true),
                    ConnectionType::Generic => {
                        ctx.datacenter.is_handshaking(false)
                            || datacenter_id == ctx.delegate.current_datacenter_id()
                            || datacenter_id == ctx.delegate.moving_to_datacenter_id()
                    }
                    _ => false,
                };
                if rearm {
                    debug!(
                        address = %self.host_address,
                        port = self.host_port,
                        "scheduling reconnect"
                    );
                    self.reconnect_at = Some(ctx.now_ms + RECONNECT_TIMEOUT_DEFAULT_MS);
                }
            }
        }
        self.useful_data = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TcpAddress;
    use mio::{Events, Poll};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    const TOKEN: Token = Token(3);

    #[derive(Default)]
    struct MockDelegate {
        connected_tokens: Vec<u32>,
        closed_reasons: Vec<i32>,
        frames: Vec<Vec<u8>>,
        quick_acks: Vec<i32>,
        resolve_requests: Vec<String>,
        pending_requests: bool,
        network_available: bool,
        network_slow: bool,
        strategy: Option<IpStrategy>,
        current_dc: u32,
        moving_dc: u32,
        bytes_sent: usize,
        bytes_received: usize,
    }

    impl MockDelegate {
        fn new() -> Self {
            Self {
                network_available: true,
                ..Self::default()
            }
        }
    }

    impl ConnectionDelegate for MockDelegate {
        fn on_connection_connected(&mut self, conn: &ConnectionHandle) {
            self.connected_tokens.push(conn.token);
        }

        fn on_connection_closed(&mut self, _conn: &ConnectionHandle, reason: DisconnectReason) {
            self.closed_reasons.push(reason.code());
        }

        fn on_connection_data_received(&mut self, _conn: &ConnectionHandle, payload: &[u8]) {
            self.frames.push(payload.to_vec());
        }

        fn on_connection_quick_ack_received(&mut self, _conn: &ConnectionHandle, ack_id: i32) {
            self.quick_acks.push(ack_id);
        }

        fn has_pending_requests(&self, _conn: &ConnectionHandle) -> bool {
            self.pending_requests
        }

        fn is_network_available(&self) -> bool {
            self.network_available
        }

        fn is_network_slow(&self) -> bool {
            self.network_slow
        }

        fn ip_strategy(&self) -> IpStrategy {
            self.strategy.unwrap_or(IpStrategy::Ipv4Only)
        }

        fn set_ip_strategy(&mut self, strategy: IpStrategy) {
            self.strategy = Some(strategy);
        }

        fn current_datacenter_id(&self) -> u32 {
            self.current_dc
        }

        fn moving_to_datacenter_id(&self) -> u32 {
            self.moving_dc
        }

        fn request_host_resolution(&mut self, host: &str, _ipv6: bool) {
            self.resolve_requests.push(host.to_owned());
        }

        fn on_bytes_received(&mut self, count: usize, _network_type: i32) {
            self.bytes_received += count;
        }

        fn on_bytes_sent(&mut self, count: usize, _network_type: i32) {
            self.bytes_sent += count;
        }
    }

    struct MockDatacenter {
        id: u32,
        address: Option<TcpAddress>,
        port: u16,
        custom_port: bool,
        repeat_checking: bool,
        handshaking: bool,
        next_calls: Vec<u32>,
        stored: usize,
    }

    impl MockDatacenter {
        fn new() -> Self {
            Self {
                id: 1,
                address: None,
                port: 443,
                custom_port: false,
                repeat_checking: false,
                handshaking: false,
                next_calls: Vec::new(),
                stored: 0,
            }
        }
    }

    impl Datacenter for MockDatacenter {
        fn datacenter_id(&self) -> u32 {
            self.id
        }

        fn current_address(&self, flags: AddressFlags) -> Option<TcpAddress> {
            if flags.contains(AddressFlags::IPV6) {
                return None;
            }
            self.address.clone()
        }

        fn current_port(&self, _flags: AddressFlags) -> u16 {
            self.port
        }

        fn next_address_or_port(&mut self, flags: AddressFlags) {
            self.next_calls.push(flags.bits());
        }

        fn is_custom_port(&self, _flags: AddressFlags) -> bool {
            self.custom_port
        }

        fn is_repeat_checking_addresses(&self) -> bool {
            self.repeat_checking
        }

        fn is_handshaking(&self, _media: bool) -> bool {
            self.handshaking
        }

        fn store_current_address_and_port(&mut self) {
            self.stored += 1;
        }
    }

    struct TestEnv {
        delegate: MockDelegate,
        datacenter: MockDatacenter,
        poll: Poll,
        pool: BufferPool,
        scratch: Vec<u8>,
        now: i64,
    }

    impl TestEnv {
        fn new() -> Self {
            Self {
                delegate: MockDelegate::new(),
                datacenter: MockDatacenter::new(),
                poll: Poll::new().unwrap(),
                pool: BufferPool::new(),
                scratch: vec![0u8; 256 * 1024],
                now: 10_000,
            }
        }

        fn ctx(&mut self) -> NetContext<'_> {
            NetContext {
                delegate: &mut self.delegate,
                datacenter: &mut self.datacenter,
                registry: self.poll.registry(),
                pool: &self.pool,
                scratch: &mut self.scratch,
                now_ms: self.now,
            }
        }
    }

    /// Poll and dispatch readiness events until `done` holds.
    fn drive(
        env: &mut TestEnv,
        conn: &mut Connection,
        done: impl Fn(&TestEnv, &Connection) -> bool,
    ) {
        let mut events = Events::with_capacity(16);
        for _ in 0..100 {
            if done(env, conn) {
                return;
            }
            env.poll
                .poll(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
            env.now += 50;
            for event in events.iter() {
                assert_eq!(event.token(), TOKEN);
                conn.on_ready(&mut env.ctx(), event);
            }
        }
        panic!("condition not reached while driving the poll loop");
    }

    // ---- state machine -----------------------------------------------------

    #[test]
    fn test_backoff_delays_on_refused_errors() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        for expected in [50, 100, 200, 400, 400] {
            conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, 0x68);
            assert_eq!(conn.reconnect_at, Some(env.now + expected));
            assert!(conn.wait_for_reconnect_timer);
        }
    }

    #[test]
    fn test_backoff_resets_after_useful_data() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        for expected in [50, 100, 200] {
            conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, 0x71);
            assert_eq!(conn.reconnect_at, Some(env.now + expected));
        }

        conn.set_has_useful_data(env.now);
        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, 0x71);
        assert_eq!(conn.reconnect_at, Some(env.now + 50));
    }

    #[test]
    fn test_backoff_not_armed_for_proxy() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Proxy, 0, TOKEN);

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, 0x68);
        assert_eq!(conn.reconnect_at, None);
        assert!(!conn.wait_for_reconnect_timer);
    }

    #[test]
    fn test_port_rotation_after_retries_exhausted() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        // First failure: one free retry before rotating.
        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
        assert!(env.datacenter.next_calls.is_empty());
        assert!(conn.is_trying_next_port);
        assert_eq!(conn.failed_connection_count, 1);

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
        assert_eq!(env.datacenter.next_calls.len(), 1);
        assert_eq!(conn.failed_connection_count, 0);
    }

    #[test]
    fn test_useful_data_grants_extra_retries() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.set_has_useful_data(env.now - 10_000);

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
        assert_eq!(conn.will_retry_connect_count, 3);
    }

    #[test]
    fn test_timeout_after_silent_connect_rotates_and_widens() {
        let mut env = TestEnv::new();
        env.delegate.current_dc = 1;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Timeout, 0);

        // No data since connect: the port rotates on the first failure.
        assert_eq!(env.datacenter.next_calls.len(), 1);
        // The idle timeout widened from 12 to 14.
        assert_eq!(conn.adaptive.current(), 14);
        // Generic connection on the current datacenter: retry in 1 s.
        assert_eq!(conn.reconnect_at, Some(env.now + 1000));
        assert!(!conn.wait_for_reconnect_timer);
        assert_eq!(env.delegate.closed_reasons, vec![2]);
    }

    #[test]
    fn test_no_rotation_when_data_flowed_on_default_port() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());
        conn.has_some_data_since_last_connect = true;

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Timeout, 0);
        assert!(env.datacenter.next_calls.is_empty());
    }

    #[test]
    fn test_custom_port_rotates_even_with_data() {
        let mut env = TestEnv::new();
        env.datacenter.custom_port = true;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());
        conn.has_some_data_since_last_connect = true;

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Timeout, 0);
        assert_eq!(env.datacenter.next_calls.len(), 1);
    }

    #[test]
    fn test_single_family_strategy_relaxes_after_wraparound() {
        let mut env = TestEnv::new();
        env.datacenter.repeat_checking = true;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
        assert_eq!(env.delegate.strategy, Some(IpStrategy::Ipv4Ipv6Random));
    }

    #[test]
    fn test_tokens_monotonic_and_cleared_on_disconnect() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        let mut previous = 0;
        for _ in 0..3 {
            conn.on_socket_connected(&mut env.ctx());
            let token = conn.connection_token();
            assert!(token > previous);
            assert_eq!(conn.stage(), ConnectionStage::Connected);
            previous = token;

            conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, -1);
            assert_eq!(conn.connection_token(), 0);
            assert_ne!(conn.stage(), ConnectionStage::Connected);
        }
        assert_eq!(env.delegate.connected_tokens.len(), 3);
    }

    #[test]
    fn test_useful_data_stabilization_window() {
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        assert!(!conn.has_useful_data(10_000));

        conn.set_has_useful_data(10_000);
        assert!(!conn.has_useful_data(10_000));
        assert!(!conn.has_useful_data(13_999));
        assert!(conn.has_useful_data(14_001));

        // Idempotent: a later call must not restart the window.
        conn.set_has_useful_data(20_000);
        assert!(conn.has_useful_data(20_000));
    }

    #[test]
    fn test_connect_without_network_reports_shutdown() {
        let mut env = TestEnv::new();
        env.delegate.network_available = false;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        conn.connect(&mut env.ctx());
        assert_eq!(env.delegate.closed_reasons, vec![0]);
        assert_eq!(conn.stage(), ConnectionStage::Idle);
    }

    #[test]
    fn test_connect_with_exhausted_addresses_schedules_retry() {
        let mut env = TestEnv::new();
        env.delegate.current_dc = 1;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        // No address available: the synchronous open failure is deferred
        // past connect() and then runs the normal failure path.
        conn.connect(&mut env.ctx());
        assert_eq!(conn.stage(), ConnectionStage::Reconnecting);
        assert_eq!(env.delegate.closed_reasons, vec![1]);
        assert_eq!(conn.reconnect_at, Some(env.now + 1000));
    }

    #[test]
    fn test_connect_waits_for_armed_backoff_timer() {
        let mut env = TestEnv::new();
        env.delegate.current_dc = 1;
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        conn.on_disconnected_internal(&mut env.ctx(), DisconnectReason::Failure, 0x68);
        assert!(conn.wait_for_reconnect_timer);

        conn.connect(&mut env.ctx());
        assert_eq!(conn.stage(), ConnectionStage::Reconnecting);

        // The 1 Hz tick past the deadline releases the gate and dials;
        // with no address left the attempt fails and re-arms at 1 s.
        env.now += 60;
        conn.check_timeout(&mut env.ctx());
        assert!(!conn.wait_for_reconnect_timer);
        assert_eq!(conn.reconnect_at, Some(env.now + 1000));
        assert_eq!(conn.stage(), ConnectionStage::Reconnecting);
    }

    #[test]
    fn test_reconnect_forces_port_rotation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut env = TestEnv::new();
        env.datacenter.address = Some(TcpAddress {
            address: "127.0.0.1".to_owned(),
            port: addr.port(),
            flags: AddressFlags::NONE,
            secret: String::new(),
        });
        env.datacenter.port = addr.port();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());

        conn.reconnect(&mut env.ctx());
        assert!(conn.force_next_port);
        assert_eq!(env.datacenter.next_calls.len(), 1);
        assert_eq!(conn.stage(), ConnectionStage::Connecting);
    }

    #[test]
    fn test_proxy_reconnect_only_suspends() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Proxy, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());

        conn.reconnect(&mut env.ctx());
        assert!(conn.is_suspended());
        assert!(env.datacenter.next_calls.is_empty());
    }

    #[test]
    fn test_suspend_resets_session_state() {
        let mut env = TestEnv::new();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);
        conn.on_socket_connected(&mut env.ctx());
        conn.first_packet_sent = true;

        conn.suspend_connection(&mut env.ctx(), false);
        assert!(conn.is_suspended());
        assert_eq!(conn.connection_token(), 0);
        assert!(!conn.first_packet_sent);
        assert!(conn.cipher.is_none());
        assert!(env.delegate.closed_reasons.iter().all(|&r| r == 0));

        // Suspending again is a no-op.
        let closed = env.delegate.closed_reasons.len();
        conn.suspend_connection(&mut env.ctx(), false);
        assert_eq!(env.delegate.closed_reasons.len(), closed);
    }

    // ---- end to end over loopback ------------------------------------------

    #[test]
    fn test_end_to_end_obfuscated_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut env = TestEnv::new();
        env.datacenter.address = Some(TcpAddress {
            address: "127.0.0.1".to_owned(),
            port: addr.port(),
            flags: AddressFlags::NONE,
            secret: String::new(),
        });
        env.datacenter.port = addr.port();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        conn.connect(&mut env.ctx());
        assert_eq!(conn.stage(), ConnectionStage::Connecting);
        drive(&mut env, &mut conn, |env, _| {
            !env.delegate.connected_tokens.is_empty()
        });
        assert_eq!(conn.stage(), ConnectionStage::Connected);
        assert_ne!(conn.connection_token(), 0);

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // A 16-byte first frame costs 64 (prelude) + 1 (prefix) + 16 on
        // the wire.
        conn.send_data(&mut env.ctx(), &[0x11; 16], false, false);
        drive(&mut env, &mut conn, |env, _| env.delegate.bytes_sent >= 81);

        let mut wire = [0u8; 81];
        peer.read_exact(&mut wire).unwrap();
        let prelude: [u8; 64] = wire[..64].try_into().unwrap();
        let mut peer_cipher = ObfuscationCipher::responder(&prelude).unwrap();

        let mut first_frame = wire[64..].to_vec();
        peer_cipher.decrypt_in_place(&mut first_frame);
        assert_eq!(first_frame[0], 0x04);
        assert_eq!(&first_frame[1..], &[0x11; 16]);

        // Quick-ack from the peer: control id only, no data callback.
        let mut quick_ack = [0x80, 0x00, 0x00, 0x01];
        peer_cipher.encrypt_in_place(&mut quick_ack);
        peer.write_all(&quick_ack).unwrap();
        drive(&mut env, &mut conn, |env, _| {
            !env.delegate.quick_acks.is_empty()
        });
        assert_eq!(env.delegate.quick_acks, vec![1]);
        assert!(env.delegate.frames.is_empty());

        // First inbound data marked the endpoint as known good.
        assert_eq!(env.datacenter.stored, 1);
        assert!(!conn.is_trying_next_port);

        // A long-form 2044-byte frame, fragmented 10 + 2038, must come
        // out as exactly one payload.
        let payload: Vec<u8> = (0..2044).map(|i| (i % 247) as u8).collect();
        let mut frame = Vec::new();
        encode_length_prefix(payload.len(), false, &mut frame);
        frame.extend_from_slice(&payload);
        peer_cipher.encrypt_in_place(&mut frame);
        assert_eq!(frame.len(), 2048);

        peer.write_all(&frame[..10]).unwrap();
        peer.flush().unwrap();
        drive(&mut env, &mut conn, |_, conn| conn.assembler.has_pending());
        peer.write_all(&frame[10..]).unwrap();
        drive(&mut env, &mut conn, |env, _| !env.delegate.frames.is_empty());
        assert_eq!(env.delegate.frames, vec![payload]);

        // Outbound ack-request flag survives the cipher.
        conn.send_data(&mut env.ctx(), &[0x22; 8], true, false);
        let sent_before = 81;
        drive(&mut env, &mut conn, |env, _| {
            env.delegate.bytes_sent >= sent_before + 9
        });
        let mut second = [0u8; 9];
        peer.read_exact(&mut second).unwrap();
        peer_cipher.decrypt_in_place(&mut second);
        assert_eq!(second[0], 0x82);
        assert_eq!(&second[1..], &[0x22; 8]);

        // Peer goes away: one Failure close, token cleared.
        drop(peer);
        drive(&mut env, &mut conn, |env, _| {
            env.delegate.closed_reasons.contains(&1)
        });
        assert_eq!(conn.connection_token(), 0);
        assert!(conn.is_disconnected());
    }

    #[test]
    fn test_hostname_connect_goes_through_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut env = TestEnv::new();
        env.datacenter.address = Some(TcpAddress {
            address: "dc.example.org".to_owned(),
            port: addr.port(),
            flags: AddressFlags::NONE,
            secret: String::new(),
        });
        env.datacenter.port = addr.port();
        let mut conn = Connection::new(ConnectionType::Generic, 0, TOKEN);

        conn.connect(&mut env.ctx());
        assert_eq!(env.delegate.resolve_requests, vec!["dc.example.org"]);
        assert!(conn.is_disconnected());

        conn.on_host_name_resolved(&mut env.ctx(), "dc.example.org", "127.0.0.1");
        drive(&mut env, &mut conn, |env, _| {
            !env.delegate.connected_tokens.is_empty()
        });
        assert_eq!(conn.stage(), ConnectionStage::Connected);
    }
}
