//! The hub's authoritative key/channel schema, key prefix
//! `rocon:`.

/// TTL (seconds) on `:ping` keys.
pub const MAX_TTL: usize = crate::config::MAX_TTL;

pub fn gatewaylist_key() -> String {
    "rocon:hub:gatewaylist".to_string()
}

pub fn gateway_root_key(gateway: &str) -> String {
    format!("rocon:{gateway}")
}

pub fn gateway_key(gateway: &str, field: &str) -> String {
    format!("rocon:{gateway}:{field}")
}

pub fn pubsub_channel(gateway: &str) -> String {
    format!("rocon:{gateway}")
}

/// Strip the `rocon:` key prefix a `gatewaylist` member carries, leaving the
/// bare gateway name.
pub fn key_base_name(key: &str) -> String {
    key.strip_prefix("rocon:").unwrap_or(key).to_string()
}

pub mod fields {
    pub const FIREWALL: &str = "firewall";
    pub const IP: &str = "ip";
    pub const PUBLIC_KEY: &str = "public_key";
    pub const ADVERTISEMENTS: &str = "advertisements";
    pub const FLIPS: &str = "flips";
    pub const PULLS: &str = "pulls";
    pub const FLIP_INS: &str = "flip_ins";
    pub const PING: &str = ":ping";
    pub const AVAILABLE: &str = "available";
    pub const TIME_SINCE_LAST_SEEN: &str = "time_since_last_seen";
    pub const LATENCY_MIN: &str = "latency:min";
    pub const LATENCY_AVG: &str = "latency:avg";
    pub const LATENCY_MAX: &str = "latency:max";
    pub const LATENCY_MDEV: &str = "latency:mdev";
    pub const NETWORK_INFO_AVAILABLE: &str = "network:info_available";
    pub const NETWORK_TYPE: &str = "network:type";
    pub const WIRELESS_BITRATE: &str = "wireless:bitrate";
    pub const WIRELESS_QUALITY: &str = "wireless:quality";
    pub const WIRELESS_SIGNAL_LEVEL: &str = "wireless:signal_level";
    pub const WIRELESS_NOISE_LEVEL: &str = "wireless:noise_level";
}

/// Health/network-quality fields published each tick alongside the `:ping`
/// refresh.
#[derive(Debug, Clone, Default)]
pub struct NetworkStatistics {
    pub network_info_available: bool,
    pub wired: bool,
    pub wireless_bitrate: f64,
    pub wireless_link_quality: i64,
    pub wireless_signal_level: f64,
    pub wireless_noise_level: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub mdev: f64,
}

/// Per-gateway snapshot as stored in the hub.
#[derive(Debug, Clone, Default)]
pub struct GatewayDirectoryEntry {
    pub firewall: bool,
    pub ip: String,
    pub public_key_pem: Vec<u8>,
    pub public_interface: Vec<crate::connection::Connection>,
    pub flips: Vec<(String, String, crate::connection::ConnectionType, String)>,
    pub pulls: Vec<(String, String, crate::connection::ConnectionType, String)>,
    pub flip_ins: Vec<StoredFlipIn>,
    pub available: bool,
    pub time_since_last_seen: i64,
    pub latency: LatencyStats,
}

/// One `flip_ins` entry: `(status, source_gateway, encrypted_connection)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFlipIn {
    pub status: FlipStatus,
    pub source_gateway: String,
    pub encrypted_connection: crate::crypto::EncryptedConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipStatus {
    Pending,
    Accepted,
    Blocked,
}

impl StoredFlipIn {
    /// `[status, source, encrypted_connection]`.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(&(
            self.status.as_str(),
            &self.source_gateway,
            self.encrypted_connection.to_wire(),
        ))
        .expect("tuple encoding of StoredFlipIn never fails")
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let (status, source_gateway, encrypted): (String, String, String) = serde_json::from_str(s).ok()?;
        let status = FlipStatus::from_str(&status)?;
        let encrypted_connection = crate::crypto::EncryptedConnection::from_wire(&encrypted).ok()?;
        Some(StoredFlipIn {
            status,
            source_gateway,
            encrypted_connection,
        })
    }
}

impl FlipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlipStatus::Pending => "pending",
            FlipStatus::Accepted => "accepted",
            FlipStatus::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FlipStatus::Pending),
            "accepted" => Some(FlipStatus::Accepted),
            "blocked" => Some(FlipStatus::Blocked),
            _ => None,
        }
    }
}

/// Wire encoding for the debug-only `flips`/`pulls` sets:
/// `[target, name, type, node]`.
pub fn serialize_debug_tuple(
    tuple: &(String, String, crate::connection::ConnectionType, String),
) -> String {
    serde_json::to_string(tuple).expect("tuple encoding of debug tuple never fails")
}

pub fn deserialize_debug_tuple(
    s: &str,
) -> Option<(String, String, crate::connection::ConnectionType, String)> {
    serde_json::from_str(s).ok()
}
