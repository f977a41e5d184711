//! The public interface: the set of local endpoints currently
//! advertised to the federation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionType, RuleSet};
use crate::hub::HubClient;

/// Committed state is single-writer (the watcher); commands never touch it
/// directly.
#[derive(Debug, Default)]
pub struct PublicInterface {
    advertised: HashSet<Connection>,
}

impl PublicInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advertised(&self) -> &HashSet<Connection> {
        &self.advertised
    }

    /// Recompute the desired advertised set from `ruleset` and the live
    /// local snapshot, issuing only the diff against the committed set to
    /// every connected hub. Level-triggered: correctness never depends on
    /// catching an edge.
    pub fn reconcile(
        &mut self,
        ruleset: &RuleSet,
        live: &HashMap<ConnectionType, Vec<Connection>>,
        hubs: &[Arc<dyn HubClient>],
    ) {
        let desired: HashSet<Connection> = live
            .values()
            .flatten()
            .filter(|c| ruleset.allow(c))
            .cloned()
            .collect();

        for connection in desired.difference(&self.advertised) {
            for hub in hubs {
                if let Err(e) = hub.advertise(connection) {
                    log::warn!("advertise({}) on {:?} failed: {e}", connection.name, hub.ip());
                }
            }
        }
        for connection in self.advertised.difference(&desired) {
            for hub in hubs {
                if let Err(e) = hub.unadvertise(connection) {
                    log::warn!("unadvertise({}) on {:?} failed: {e}", connection.name, hub.ip());
                }
            }
        }

        self.advertised = desired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapter;
    use crate::adapter::LocalAdapter;
    use crate::hub::client::fake::FakeHub;
    use crate::connection::Rule;

    fn conn(name: &str) -> Connection {
        Connection::new(ConnectionType::Publisher, name, "/g1/talker", "std_msgs/String", "tcp://h:1")
    }

    #[test]
    fn reconcile_advertises_only_allowed_live_connections_and_tracks_them() {
        let adapter = FakeAdapter::new();
        adapter.set_live(ConnectionType::Publisher, vec![conn("/chatter"), conn("/secret")]);

        let hub = Arc::new(FakeHub::new("10.0.0.1", 6379));
        hub.register_gateway(false, "G1", "10.0.0.2").unwrap();
        let hubs: Vec<Arc<dyn HubClient>> = vec![hub.clone()];

        let mut ruleset = RuleSet::default();
        ruleset.whitelist.push(Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap());

        let mut iface = PublicInterface::new();
        iface.reconcile(&ruleset, &adapter.get_connection_state(), &hubs);

        assert!(iface.advertised().contains(&conn("/chatter")));
        assert!(!iface.advertised().contains(&conn("/secret")));

        let remote = hub.remote_gateway_info("G1").unwrap().unwrap();
        assert_eq!(remote.public_interface, vec![conn("/chatter")]);
    }

    #[test]
    fn reconcile_retracts_when_rule_no_longer_matches() {
        let adapter = FakeAdapter::new();
        adapter.set_live(ConnectionType::Publisher, vec![conn("/chatter")]);
        let hub = Arc::new(FakeHub::new("10.0.0.1", 6379));
        hub.register_gateway(false, "G1", "10.0.0.2").unwrap();
        let hubs: Vec<Arc<dyn HubClient>> = vec![hub.clone()];

        let mut ruleset = RuleSet::default();
        ruleset.whitelist.push(Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap());

        let mut iface = PublicInterface::new();
        iface.reconcile(&ruleset, &adapter.get_connection_state(), &hubs);
        assert_eq!(hub.remote_gateway_info("G1").unwrap().unwrap().public_interface.len(), 1);

        ruleset.whitelist.clear();
        iface.reconcile(&ruleset, &adapter.get_connection_state(), &hubs);
        assert!(iface.advertised().is_empty());
        assert!(hub.remote_gateway_info("G1").unwrap().unwrap().public_interface.is_empty());
    }
}
