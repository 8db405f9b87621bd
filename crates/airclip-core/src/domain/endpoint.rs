//! Node identity: [`EndPoint`] and the [`PeerKey`] derived from it.
//!
//! An endpoint is identified by the tuple *(address, name, device name)*.
//! Address alone is not enough: several logical nodes may share one NIC
//! (loopback testing, containers), and two machines may share a display name.
//!
//! The advertised transfer port travels with the endpoint but is metadata,
//! not identity: a peer that restarts on another port is still the same peer.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Key under which a peer is tracked in the peer set and the connection pool.
///
/// Rendered as `"{name}-{device}@{ip}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(String);

impl PeerKey {
    /// Wraps an already-formatted key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn unspecified_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// The advertised identity of one node.
///
/// Immutable once constructed; the builder-style `with_*` methods return a new
/// value.  The only interior state is the memoized [`PeerKey`], which is
/// computed on first use and never serialized.
///
/// Equality and hashing consider only the identity tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPoint {
    /// Observed network address.  Receivers overwrite whatever the sender put
    /// here with the address the packet actually came from.
    #[serde(rename = "ip", default = "unspecified_ip")]
    address: IpAddr,
    name: String,
    device_name: String,
    /// TCP port the node accepts transfer connections on; `0` means "the
    /// receiver's configured default".
    #[serde(default)]
    transfer_port: u16,
    #[serde(skip)]
    key: OnceLock<PeerKey>,
}

impl EndPoint {
    /// Creates an endpoint with a known address.
    pub fn new(address: IpAddr, name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            device_name: device_name.into(),
            transfer_port: 0,
            key: OnceLock::new(),
        }
    }

    /// Creates the local node's endpoint.
    ///
    /// The address is left unspecified: peers learn it from the source address
    /// of our packets, which is the only address that is reliably routable
    /// from their side.
    pub fn local(name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self::new(unspecified_ip(), name, device_name)
    }

    /// Returns a copy with `address` replaced.
    pub fn with_address(&self, address: IpAddr) -> Self {
        Self {
            address,
            name: self.name.clone(),
            device_name: self.device_name.clone(),
            transfer_port: self.transfer_port,
            key: OnceLock::new(),
        }
    }

    /// Returns a copy advertising `port` as its transfer port.
    pub fn with_transfer_port(mut self, port: u16) -> Self {
        self.transfer_port = port;
        self
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn transfer_port(&self) -> u16 {
        self.transfer_port
    }

    /// Human-readable sender label, `"{name}-{device}"`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.name, self.device_name)
    }

    /// Returns the identity key, computing it on first call.
    pub fn key(&self) -> &PeerKey {
        self.key.get_or_init(|| {
            PeerKey(format!(
                "{}-{}@{}",
                self.name, self.device_name, self.address
            ))
        })
    }

    /// Returns `true` when name and device name match, ignoring the address.
    pub fn same_display_identity(&self, other: &EndPoint) -> bool {
        self.name == other.name && self.device_name == other.device_name
    }
}

impl PartialEq for EndPoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.name == other.name
            && self.device_name == other.device_name
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.name.hash(state);
        self.device_name.hash(state);
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_includes_name_device_and_address() {
        // Arrange
        let ep = EndPoint::new(ip("192.168.1.20"), "henry", "windows");

        // Act
        let key = ep.key();

        // Assert
        assert_eq!(key.as_str(), "henry-windows@192.168.1.20");
    }

    #[test]
    fn test_equality_ignores_transfer_port() {
        let a = EndPoint::new(ip("10.0.0.1"), "a", "pc").with_transfer_port(9457);
        let b = EndPoint::new(ip("10.0.0.1"), "a", "pc").with_transfer_port(4000);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_same_name_at_different_addresses_are_distinct() {
        let a = EndPoint::new(ip("10.0.0.1"), "a", "pc");
        let b = EndPoint::new(ip("10.0.0.2"), "a", "pc");
        assert_ne!(a, b);
        assert_ne!(a.key(), b.key());
        assert!(a.same_display_identity(&b));
    }

    #[test]
    fn test_with_address_recomputes_key() {
        // Arrange – force memoization of the unspecified-address key
        let local = EndPoint::local("a", "pc");
        let before = local.key().clone();

        // Act
        let observed = local.with_address(ip("172.16.0.9"));

        // Assert
        assert_eq!(before.as_str(), "a-pc@0.0.0.0");
        assert_eq!(observed.key().as_str(), "a-pc@172.16.0.9");
    }

    #[test]
    fn test_label_joins_name_and_device() {
        let ep = EndPoint::local("henry", "laptop");
        assert_eq!(ep.label(), "henry-laptop");
    }

    #[test]
    fn test_json_uses_wire_field_names() {
        // Arrange
        let ep = EndPoint::new(ip("192.168.0.4"), "n", "d").with_transfer_port(9457);

        // Act
        let json = serde_json::to_value(&ep).unwrap();

        // Assert
        assert_eq!(json["ip"], "192.168.0.4");
        assert_eq!(json["name"], "n");
        assert_eq!(json["deviceName"], "d");
        assert_eq!(json["transferPort"], 9457);
        assert!(json.get("key").is_none(), "memoized key must not be serialized");
    }

    #[test]
    fn test_json_without_optional_fields_uses_defaults() {
        // Arrange – a record from a peer that does not advertise ip or port
        let json = r#"{"name":"n","deviceName":"d"}"#;

        // Act
        let ep: EndPoint = serde_json::from_str(json).unwrap();

        // Assert
        assert_eq!(ep.address(), ip("0.0.0.0"));
        assert_eq!(ep.transfer_port(), 0);
    }

    #[test]
    fn test_hash_matches_equality() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(EndPoint::new(ip("10.0.0.1"), "a", "pc").with_transfer_port(1));
        set.insert(EndPoint::new(ip("10.0.0.1"), "a", "pc").with_transfer_port(2));
        assert_eq!(set.len(), 1);
    }
}
