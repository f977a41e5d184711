//! The local-namespace adapter contract. The
//! concrete adapter that talks to a real local master/namespace is out of
//! scope here; this trait is the boundary the watcher and pulled interface
//! are written against.

use std::collections::HashMap;

use crate::connection::{Connection, ConnectionType};
use crate::error::GatewayError;

pub trait LocalAdapter: Send + Sync {
    /// Enumerate all live local endpoints, keyed by type.
    fn get_connection_state(&self) -> HashMap<ConnectionType, Vec<Connection>>;

    /// Register a foreign connection locally under a synthetic node name,
    /// returning the local node name actually assigned.
    fn register(&self, connection: &Connection, local_node_name: &str) -> Result<String, GatewayError>;

    /// Unregister a previously registered foreign connection.
    fn unregister(&self, local_node_name: &str) -> Result<(), GatewayError>;

    /// The URI of the local master this adapter fronts.
    fn get_master_uri(&self) -> String;
}
