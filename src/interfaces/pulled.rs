//! The pulled interface: remote endpoints imported into the
//! local namespace under explicit pull rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::adapter::LocalAdapter;
use crate::connection::RemoteRule;
use crate::hub::HubClient;
use crate::registration::Registration;

#[derive(Debug, Default)]
pub struct PulledInterface {
    registrations: HashMap<String, HashSet<Registration>>,
    /// Consecutive `LocalAdapter::register` failures for a registration
    /// still desired but not yet established.
    failures: HashMap<Registration, u32>,
    /// Registrations that hit the retry limit; skipped until they drop out
    /// of the desired set (source retracts, rule changes) and come back.
    given_up: HashSet<Registration>,
}

impl PulledInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> &HashMap<String, HashSet<Registration>> {
        &self.registrations
    }

    /// For every pull rule, expand its target-gateway pattern against each
    /// hub's live gateway list; for every resolved gateway that is not
    /// firewalled off -- or that is, but we hold a valid accepted inbound
    /// flip offer from it (§4.5's documented exception; `accepted_inbound_
    /// sources` is `FlippedInterface::accepted_inbound_sources`) -- read its
    /// advertisements and ensure a local registration exists for every one
    /// matching the rule. Registrations whose source no longer offers them
    /// are revoked. A registration that keeps failing locally is retried up
    /// to `retry_limit` times before being dropped with a log line, per
    /// tick.
    pub fn reconcile(
        &mut self,
        pull_rules: &[RemoteRule],
        hubs: &[Arc<dyn HubClient>],
        adapter: &dyn LocalAdapter,
        retry_limit: u32,
        accepted_inbound_sources: &HashSet<String>,
    ) {
        let mut desired: HashMap<String, HashSet<Registration>> = HashMap::new();
        // Which hub each resolved gateway was last seen on, so the register/
        // revoke passes below can post to the same directory without
        // re-resolving the target pattern.
        let mut gateway_hub: HashMap<String, Arc<dyn HubClient>> = HashMap::new();

        for remote_rule in pull_rules {
            let concrete_rules = remote_rule.rule.expand_action();
            for hub in hubs {
                let Ok(names) = hub.matches_remote_gateway_name(&remote_rule.target_gateway) else {
                    continue;
                };
                for gateway in names {
                    let firewalled = hub.get_remote_gateway_firewall_flag(&gateway).unwrap_or(true);
                    if firewalled && !accepted_inbound_sources.contains(&gateway) {
                        continue;
                    }
                    let Ok(state) = hub.get_remote_connection_state(&gateway) else {
                        continue;
                    };
                    let local_name = hub.unique_name().unwrap_or_else(|| "unknown".to_string());
                    gateway_hub.insert(gateway.clone(), Arc::clone(hub));
                    for connection in state.values().flatten() {
                        if !concrete_rules.iter().any(|r| r.matches(connection)) {
                            continue;
                        }
                        let local_node_name = Registration::synthetic_node_name(&local_name, &gateway, &connection.name);
                        desired
                            .entry(gateway.clone())
                            .or_default()
                            .insert(Registration::new(connection.clone(), gateway.clone(), local_node_name));
                    }
                }
            }
        }

        for (gateway, existing) in &self.registrations {
            let wanted = desired.get(gateway);
            for registration in existing {
                let still_wanted = wanted.map(|w| w.contains(registration)).unwrap_or(false);
                if !still_wanted {
                    if let Err(e) = adapter.unregister(&registration.local_node_name) {
                        log::warn!("unregister({}) failed: {e}", registration.local_node_name);
                    }
                    if let Some(hub) = gateway_hub.get(gateway).or_else(|| hubs.first()) {
                        let connection = &registration.connection;
                        if let Err(e) = hub.remove_pull_details(gateway, &connection.name, connection.kind, &connection.node_uri) {
                            log::warn!("remove_pull_details({}) failed: {e}", connection.name);
                        }
                    }
                }
            }
        }

        // `confirmed` starts from whatever was already established and
        // still desired; a failed registration is left out so the next tick
        // retries it instead of treating it as settled.
        let mut confirmed: HashMap<String, HashSet<Registration>> = HashMap::new();
        for (gateway, wanted) in &desired {
            let existing = self.registrations.get(gateway);
            for registration in wanted {
                let already_registered = existing.map(|e| e.contains(registration)).unwrap_or(false);
                if already_registered {
                    confirmed.entry(gateway.clone()).or_default().insert(registration.clone());
                    continue;
                }
                if self.given_up.contains(registration) {
                    continue;
                }
                match adapter.register(&registration.connection, &registration.local_node_name) {
                    Ok(_) => {
                        self.failures.remove(registration);
                        confirmed.entry(gateway.clone()).or_default().insert(registration.clone());
                        if let Some(hub) = gateway_hub.get(gateway) {
                            let connection = &registration.connection;
                            if let Err(e) = hub.post_pull_details(gateway, &connection.name, connection.kind, &connection.node_uri) {
                                log::warn!("post_pull_details({}) failed: {e}", connection.name);
                            }
                        }
                    }
                    Err(e) => {
                        let count = self.failures.entry(registration.clone()).or_insert(0);
                        *count += 1;
                        if *count >= retry_limit {
                            log::warn!(
                                "register({}) failed {count} times, giving up: {e}",
                                registration.local_node_name
                            );
                            self.failures.remove(registration);
                            self.given_up.insert(registration.clone());
                        } else {
                            log::warn!("register({}) failed ({count}/{retry_limit}): {e}", registration.local_node_name);
                        }
                    }
                }
            }
        }

        // Drop retry/give-up bookkeeping for anything no longer desired so a
        // registration that reappears later (source re-offers, rule changes
        // back) gets a fresh set of attempts.
        let all_desired: HashSet<&Registration> = desired.values().flatten().collect();
        self.failures.retain(|r, _| all_desired.contains(r));
        self.given_up.retain(|r| all_desired.contains(r));

        self.registrations = confirmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapter;
    use crate::connection::{Connection, ConnectionType, Rule};
    use crate::hub::client::fake::FakeHub;

    #[test]
    fn pulls_matching_remote_advertisement_and_registers_locally() {
        let source = Arc::new(FakeHub::new("10.0.0.1", 6379));
        source.register_gateway(false, "G1", "10.0.0.2").unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1");
        source.advertise(&conn).unwrap();
        // Re-register as our own identity so "G1" becomes a remote entry in
        // the shared directory rather than self.
        source.register_gateway(false, "G2", "10.0.0.3").unwrap();

        let hubs: Vec<Arc<dyn HubClient>> = vec![source.clone()];
        let pull_rules = vec![RemoteRule::new("G1", Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap()).unwrap()];

        let adapter = FakeAdapter::new();
        let mut iface = PulledInterface::new();
        iface.reconcile(&pull_rules, &hubs, &adapter, 5, &HashSet::new());

        assert_eq!(adapter.registered_names(), vec!["/G2/pull/G1/chatter".to_string()]);
        assert_eq!(iface.registrations().get("G1").unwrap().len(), 1);
    }

    #[test]
    fn firewalled_remote_is_never_pulled_from() {
        let source = Arc::new(FakeHub::new("10.0.0.1", 6379));
        source.register_gateway(true, "G1", "10.0.0.2").unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1");
        source.advertise(&conn).unwrap();
        source.register_gateway(false, "G2", "10.0.0.3").unwrap();

        let hubs: Vec<Arc<dyn HubClient>> = vec![source.clone()];
        let pull_rules = vec![RemoteRule::new("G1", Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap()).unwrap()];

        let adapter = FakeAdapter::new();
        let mut iface = PulledInterface::new();
        iface.reconcile(&pull_rules, &hubs, &adapter, 5, &HashSet::new());
        assert!(adapter.registered_names().is_empty());
    }

    #[test]
    fn firewalled_remote_is_pulled_from_when_we_hold_an_accepted_inbound_offer_from_it() {
        let source = Arc::new(FakeHub::new("10.0.0.1", 6379));
        source.register_gateway(true, "G1", "10.0.0.2").unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1");
        source.advertise(&conn).unwrap();
        source.register_gateway(false, "G2", "10.0.0.3").unwrap();

        let hubs: Vec<Arc<dyn HubClient>> = vec![source.clone()];
        let pull_rules = vec![RemoteRule::new("G1", Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap()).unwrap()];

        let adapter = FakeAdapter::new();
        let mut iface = PulledInterface::new();
        let accepted_sources: HashSet<String> = ["G1".to_string()].into_iter().collect();
        iface.reconcile(&pull_rules, &hubs, &adapter, 5, &accepted_sources);

        assert_eq!(adapter.registered_names(), vec!["/G2/pull/G1/chatter".to_string()]);
        assert_eq!(iface.registrations().get("G1").unwrap().len(), 1);
    }

    #[test]
    fn vanished_advertisement_revokes_the_registration() {
        let source = Arc::new(FakeHub::new("10.0.0.1", 6379));
        source.register_gateway(false, "G1", "10.0.0.2").unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1");
        source.advertise(&conn).unwrap();
        source.register_gateway(false, "G2", "10.0.0.3").unwrap();

        let hubs: Vec<Arc<dyn HubClient>> = vec![source.clone()];
        let pull_rules = vec![RemoteRule::new("G1", Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap()).unwrap()];

        let adapter = FakeAdapter::new();
        let mut iface = PulledInterface::new();
        iface.reconcile(&pull_rules, &hubs, &adapter, 5, &HashSet::new());
        assert_eq!(adapter.registered_names().len(), 1);

        // `unadvertise` always acts on our own identity (now "G2"), so strip
        // G1's advertisement directly to simulate the source retracting it.
        source.gateways.lock().unwrap().get_mut("G1").unwrap().advertisements.clear();
        iface.reconcile(&pull_rules, &hubs, &adapter, 5, &HashSet::new());
        assert!(adapter.registered_names().is_empty());
    }

    #[test]
    fn failed_registration_is_retried_then_given_up_and_recovers_if_redesired() {
        let source = Arc::new(FakeHub::new("10.0.0.1", 6379));
        source.register_gateway(false, "G1", "10.0.0.2").unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1");
        source.advertise(&conn).unwrap();
        source.register_gateway(false, "G2", "10.0.0.3").unwrap();

        let hubs: Vec<Arc<dyn HubClient>> = vec![source.clone()];
        let pull_rules = vec![RemoteRule::new("G1", Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap()).unwrap()];

        let adapter = FakeAdapter::new();
        adapter.fail_register_for("/G2/pull/G1/chatter");
        let mut iface = PulledInterface::new();

        for _ in 0..3 {
            iface.reconcile(&pull_rules, &hubs, &adapter, 3, &HashSet::new());
            assert!(adapter.registered_names().is_empty());
        }
        // Fourth attempt would be the same registration yet again, but the
        // retry bound (3) was already hit on the previous tick, so the next
        // tick must not even try.
        iface.reconcile(&pull_rules, &hubs, &adapter, 3, &HashSet::new());
        assert!(adapter.registered_names().is_empty());
        assert!(iface.registrations().get("G1").map(|s| s.is_empty()).unwrap_or(true));

        // The connection drops out of desired state (source retracts) and
        // comes back; give-up bookkeeping is scoped to desiredness, so the
        // registration gets a clean slate rather than staying given up
        // forever.
        source.gateways.lock().unwrap().get_mut("G1").unwrap().advertisements.clear();
        iface.reconcile(&pull_rules, &hubs, &adapter, 3, &HashSet::new());
        source.gateways.lock().unwrap().get_mut("G1").unwrap().advertisements.push(conn.to_wire());
        adapter.stop_failing_register_for("/G2/pull/G1/chatter");
        iface.reconcile(&pull_rules, &hubs, &adapter, 3, &HashSet::new());
        assert_eq!(adapter.registered_names(), vec!["/G2/pull/G1/chatter".to_string()]);
    }
}
