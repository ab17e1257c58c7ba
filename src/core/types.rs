//! Core types shared across the transport.

/// Role of a connection within its datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Main request/response channel.
    Generic,
    /// Request/response channel pinned to media datacenters.
    GenericMedia,
    /// Bulk download channel.
    Download,
    /// Bulk upload channel.
    Upload,
    /// Long-lived push notification channel.
    Push,
    /// Short-lived channel bound to temporary addresses.
    Temp,
    /// Channel that talks to a statically configured proxy endpoint.
    Proxy,
}

impl ConnectionType {
    /// True for types that prefer download-flagged (media) addresses.
    pub fn is_media(self) -> bool {
        matches!(self, ConnectionType::GenericMedia | ConnectionType::Download)
    }

    /// True for types whose idle timeout adapts to throughput.
    pub fn has_adaptive_timeout(self) -> bool {
        matches!(
            self,
            ConnectionType::Generic | ConnectionType::GenericMedia | ConnectionType::Temp
        )
    }
}

/// Lifecycle stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    /// No socket; eligible for auto-reconnect on the next send.
    Idle,
    /// TCP connect in flight.
    Connecting,
    /// Socket open and writable at least once.
    Connected,
    /// Quiescent; will not reconnect until explicitly asked.
    Suspended,
    /// Between failed attempts; a retry is pending or imminent.
    Reconnecting,
}

/// Why a socket was closed, as reported to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Intentional local shutdown; no auto-reconnect.
    Shutdown,
    /// Protocol or transport failure.
    Failure,
    /// Idle timeout.
    Timeout,
}

impl DisconnectReason {
    /// Numeric code used on the management interface.
    pub fn code(self) -> i32 {
        match self {
            DisconnectReason::Shutdown => 0,
            DisconnectReason::Failure => 1,
            DisconnectReason::Timeout => 2,
        }
    }
}

/// Address-family selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpStrategy {
    /// Only IPv4 addresses.
    Ipv4Only,
    /// Only IPv6 addresses.
    Ipv6Only,
    /// Pick IPv6 with probability 1/3, sticking with whichever family
    /// last carried useful data.
    Ipv4Ipv6Random,
}

/// Selector bits for datacenter address lookups.
///
/// The bit values are part of the management interface and are owned by
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressFlags(u32);

impl AddressFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Statically configured (proxy) endpoint.
    pub const STATIC: Self = Self(1);
    /// Download/media address bucket.
    pub const DOWNLOAD: Self = Self(2);
    /// Temporary address bucket.
    pub const TEMP: Self = Self(4);
    /// IPv6 address bucket.
    pub const IPV6: Self = Self(8);

    /// Create flags from a raw bit set.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit set.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Union of two flag sets.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One datacenter endpoint, as handed out by the address registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    /// Numeric IP or hostname.
    pub address: String,
    /// Port configured for this address; only authoritative for static
    /// (proxy) endpoints.
    pub port: u16,
    /// Flag bits this address was registered under.
    pub flags: AddressFlags,
    /// Obfuscation secret bound to this endpoint, if any.
    pub secret: String,
}

/// Lightweight identity of a connection, passed to delegate callbacks.
///
/// The upper layer distinguishes successive TCP sessions on the same
/// logical connection by `token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Connection role.
    pub kind: ConnectionType,
    /// Per-type index.
    pub num: u8,
    /// Per-connect token; 0 when not connected.
    pub token: u32,
    /// Random id of the logical session.
    pub session_id: u64,
}
