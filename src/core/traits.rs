//! Traits through which the transport talks to its environment.
//!
//! The connection never owns its collaborators: the hosting manager
//! implements [`ConnectionDelegate`], the address registry implements
//! [`Datacenter`], and both are lent to the connection per call through
//! `NetContext`.

use super::types::{AddressFlags, ConnectionHandle, DisconnectReason, IpStrategy, TcpAddress};

/// Upward interface implemented by the hosting manager.
///
/// All methods are invoked on the runtime thread, possibly from inside a
/// connection entry point; implementations must not call back into the
/// connection synchronously.
pub trait ConnectionDelegate {
    /// A TCP session reached the connected state and was assigned `token`.
    fn on_connection_connected(&mut self, conn: &ConnectionHandle);

    /// The session closed. Fires exactly once per connect attempt.
    fn on_connection_closed(&mut self, conn: &ConnectionHandle, reason: DisconnectReason);

    /// One decoded frame payload, in wire order.
    fn on_connection_data_received(&mut self, conn: &ConnectionHandle, payload: &[u8]);

    /// A quick-ack control frame carrying a 31-bit message id.
    fn on_connection_quick_ack_received(&mut self, conn: &ConnectionHandle, ack_id: i32);

    /// Whether requests are queued on this connection. Consulted by the
    /// idle-timeout check: an idle socket with no pending requests is
    /// healthy and only has its idle clock reset.
    fn has_pending_requests(&self, conn: &ConnectionHandle) -> bool;

    /// Whether the device currently has connectivity.
    fn is_network_available(&self) -> bool;

    /// Whether the current network is classified as slow (widens upload
    /// timeouts).
    fn is_network_slow(&self) -> bool {
        false
    }

    /// Opaque network classifier forwarded to the byte accounting hooks.
    fn network_type(&self) -> i32 {
        0
    }

    /// Current address-family policy.
    fn ip_strategy(&self) -> IpStrategy {
        IpStrategy::Ipv4Only
    }

    /// Policy change requested by the transport (after a single-family
    /// strategy exhausted the address list).
    fn set_ip_strategy(&mut self, _strategy: IpStrategy) {}

    /// Family used by the last randomly-picked connect.
    fn last_protocol_is_ipv6(&self) -> bool {
        false
    }

    /// Record the family of a random family pick.
    fn set_last_protocol_is_ipv6(&mut self, _ipv6: bool) {}

    /// Whether the last-used family went on to carry useful data; the
    /// random strategy sticks with that family while set.
    fn last_protocol_useful_data(&self) -> bool {
        false
    }

    /// Set or clear the sticky-family marker.
    fn set_last_protocol_useful_data(&mut self, _value: bool) {}

    /// Id of the datacenter the account currently lives on.
    fn current_datacenter_id(&self) -> u32 {
        0
    }

    /// Id of the datacenter a migration is moving the account to, if any.
    fn moving_to_datacenter_id(&self) -> u32 {
        0
    }

    /// The connection was given a hostname instead of a numeric address;
    /// the resolver must eventually call
    /// `Connection::on_host_name_resolved` on the runtime thread.
    fn request_host_resolution(&mut self, _host: &str, _ipv6: bool) {}

    /// Byte accounting: `count` bytes arrived from the kernel.
    fn on_bytes_received(&mut self, _count: usize, _network_type: i32) {}

    /// Byte accounting: `count` bytes were accepted by the kernel.
    fn on_bytes_sent(&mut self, _count: usize, _network_type: i32) {}
}

/// Sideways interface to the datacenter address registry.
///
/// The datacenter outlives its connections; the connection keeps no owning
/// reference to it.
pub trait Datacenter {
    /// Registry id, compared against the manager's current/moving ids when
    /// deciding whether to auto-rearm a reconnect.
    fn datacenter_id(&self) -> u32;

    /// Current endpoint for the given flag set, or `None` when the bucket
    /// is exhausted.
    fn current_address(&self, flags: AddressFlags) -> Option<TcpAddress>;

    /// Current port for the given flag set.
    fn current_port(&self, flags: AddressFlags) -> u16;

    /// Rotate to the next address or port for the flag set.
    fn next_address_or_port(&mut self, flags: AddressFlags);

    /// Whether the current port for the flag set is a custom
    /// (non-default) one.
    fn is_custom_port(&self, flags: AddressFlags) -> bool;

    /// Whether rotation has wrapped around the whole address list.
    fn is_repeat_checking_addresses(&self) -> bool;

    /// Whether an auth-key handshake is in flight for this datacenter
    /// (`media` selects the media handshake role).
    fn is_handshaking(&self, media: bool) -> bool;

    /// Persist the current address/port pair as known-good.
    fn store_current_address_and_port(&mut self);
}
