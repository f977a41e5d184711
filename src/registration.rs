//! [`Registration`]: a foreign Connection the local adapter has been asked
//! to register on our behalf.

use crate::connection::Connection;

/// A foreign Connection registered locally, tagged with where it came from
/// and the synthetic local node name assigned at registration time so it
/// can be revoked cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub connection: Connection,
    pub source_gateway: String,
    pub local_node_name: String,
}

impl Registration {
    pub fn new(connection: Connection, source_gateway: impl Into<String>, local_node_name: impl Into<String>) -> Self {
        Registration {
            connection,
            source_gateway: source_gateway.into(),
            local_node_name: local_node_name.into(),
        }
    }

    /// Synthetic node name derived from `(local_gateway, source_gateway,
    /// connection.name)` so cleanup is unambiguous even across repeated
    /// pulls of the same name from different sources, and the registered
    /// node is visibly ours in the local namespace (scenario S1: `/G2/pull/
    /// G1/chatter`, not a bare `/pull/G1/chatter`).
    pub fn synthetic_node_name(local_gateway: &str, source_gateway: &str, connection_name: &str) -> String {
        format!("/{local_gateway}/pull/{source_gateway}{connection_name}")
    }
}
