//! The flipped interface: outbound flip rules and their
//! materializations, plus the inbound-offer state machine
//! `pending -> accepted | blocked` and the local registrations an accepted
//! offer produces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::LocalAdapter;
use crate::connection::{Connection, ConnectionType, Rule, RuleSet};
use crate::hub::schema::FlipStatus;
use crate::hub::HubClient;
use crate::registration::Registration;
use crate::rule_store::RuleStore;

/// `(target_gateway, connection)` — the identity of one outbound flip or one
/// inbound offer.
type FlipKey = (String, Connection);

#[derive(Debug, Default)]
pub struct FlippedInterface {
    flipped_out: HashMap<FlipKey, FlipStatus>,
    inbound: HashMap<FlipKey, FlipStatus>,
    inbound_registrations: HashMap<FlipKey, Registration>,
    /// Consecutive `LocalAdapter::register` failures for an accepted offer
    /// that is not yet locally registered.
    registration_failures: HashMap<FlipKey, u32>,
    /// Accepted offers that hit the retry limit; not retried again until the
    /// offer is withdrawn and re-requested.
    registration_given_up: HashMap<FlipKey, ()>,
}

impl FlippedInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flipped_out(&self) -> &HashMap<FlipKey, FlipStatus> {
        &self.flipped_out
    }

    pub fn inbound(&self) -> &HashMap<FlipKey, FlipStatus> {
        &self.inbound
    }

    /// Distinct source gateways we hold at least one `accepted` inbound flip
    /// offer from. §4.5's pull exception: a firewalled gateway is still
    /// pulled from when we already hold a valid accepted offer sourced from
    /// it.
    pub fn accepted_inbound_sources(&self) -> std::collections::HashSet<String> {
        self.inbound
            .iter()
            .filter(|(_, status)| **status == FlipStatus::Accepted)
            .map(|((source, _), _)| source.clone())
            .collect()
    }

    /// Expand each outbound flip rule's target pattern over every hub's live
    /// gateway list, skip firewalled targets, and flip/unflip the diff
    /// against locally-live, public-eligible connections.
    pub fn reconcile_outbound(
        &mut self,
        flip_rules: &[crate::connection::RemoteRule],
        public_ruleset: &RuleSet,
        live: &HashMap<ConnectionType, Vec<Connection>>,
        hubs: &[Arc<dyn HubClient>],
        flip_timeout: Duration,
    ) {
        let eligible: Vec<&Connection> = live.values().flatten().filter(|c| public_ruleset.allow(c)).collect();

        let mut desired: HashMap<FlipKey, ()> = HashMap::new();
        for remote_rule in flip_rules {
            let concrete_rules = remote_rule.rule.expand_action();
            for hub in hubs {
                let Ok(names) = hub.matches_remote_gateway_name(&remote_rule.target_gateway) else {
                    continue;
                };
                for gateway in names {
                    if hub.get_remote_gateway_firewall_flag(&gateway).unwrap_or(true) {
                        continue;
                    }
                    for connection in eligible.iter().filter(|c| concrete_rules.iter().any(|r| r.matches(c))) {
                        let key = (gateway.clone(), (*connection).clone());
                        desired.insert(key.clone(), ());
                        if !self.flipped_out.contains_key(&key) {
                            match hub.send_flip_request(&gateway, connection, flip_timeout) {
                                Ok(true) => {
                                    self.flipped_out.insert(key, FlipStatus::Pending);
                                    if let Err(e) = hub.post_flip_details(&gateway, &connection.name, connection.kind, &connection.node_uri) {
                                        log::warn!("post_flip_details({}) failed: {e}", connection.name);
                                    }
                                }
                                Ok(false) => log::warn!("flip of {} to {gateway} timed out", connection.name),
                                Err(e) => log::warn!("flip of {} to {gateway} failed: {e}", connection.name),
                            }
                        }
                    }
                }
            }
        }

        let stale: Vec<FlipKey> = self.flipped_out.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
        for (gateway, connection) in stale {
            let rule = Rule::new(connection.kind, &regex::escape(&connection.name), ".*").ok();
            if let Some(rule) = rule {
                for hub in hubs {
                    if let Err(e) = hub.send_unflip_request(&gateway, &rule) {
                        log::warn!("unflip of {} from {gateway} failed: {e}", connection.name);
                    }
                    if let Err(e) = hub.remove_flip_details(&gateway, &connection.name, connection.kind, &connection.node_uri) {
                        log::warn!("remove_flip_details({}) failed: {e}", connection.name);
                    }
                }
            }
            self.flipped_out.remove(&(gateway, connection));
        }
    }

    /// Read inbound offers from every hub, run the accept policy, write
    /// status transitions back to the hub, and materialize/retract local
    /// registrations for accepted offers. A registration that keeps failing
    /// locally is retried up to `retry_limit` times before being dropped
    /// with a log line, per tick.
    pub fn reconcile_inbound(&mut self, rules: &RuleStore, hubs: &[Arc<dyn HubClient>], adapter: &dyn LocalAdapter, retry_limit: u32) {
        let mut seen: HashMap<FlipKey, ()> = HashMap::new();

        for hub in hubs {
            let Ok(offers) = hub.get_unblocked_flipped_in_connections() else { continue };
            let local_name = hub.unique_name().unwrap_or_else(|| "unknown".to_string());
            for (connection, source_gateway) in offers {
                let key = (source_gateway.clone(), connection.clone());
                seen.insert(key.clone(), ());

                let current = self.inbound.get(&key).copied().unwrap_or(FlipStatus::Pending);
                if current == FlipStatus::Blocked {
                    continue;
                }

                let accept = rules.accepts_inbound(&source_gateway, &connection);
                if current == FlipStatus::Accepted && accept {
                    // Already accepted; retry the local registration if an
                    // earlier attempt failed and hasn't been given up on yet.
                    if !self.inbound_registrations.contains_key(&key) && !self.registration_given_up.contains_key(&key) {
                        self.try_register(key, connection, source_gateway, &local_name, adapter, retry_limit);
                    }
                    continue;
                }
                let new_status = if accept { FlipStatus::Accepted } else { FlipStatus::Blocked };
                match hub.update_flip_request_status(&connection, &source_gateway, new_status) {
                    Ok(true) => {
                        self.inbound.insert(key.clone(), new_status);
                        if new_status == FlipStatus::Accepted {
                            self.try_register(key, connection, source_gateway, &local_name, adapter, retry_limit);
                        } else {
                            self.registration_failures.remove(&key);
                            self.registration_given_up.remove(&key);
                            if let Some(registration) = self.inbound_registrations.remove(&key) {
                                // Accept policy reversed on an already-registered offer.
                                if let Err(e) = adapter.unregister(&registration.local_node_name) {
                                    log::warn!("unregister({}) failed: {e}", registration.local_node_name);
                                }
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("status update for inbound offer from {source_gateway} failed: {e}"),
                }
            }
        }

        // An offer the source withdrew (no longer present anywhere) drops its
        // local registration if it had one.
        let vanished: Vec<FlipKey> = self.inbound.keys().filter(|k| !seen.contains_key(*k)).cloned().collect();
        for key in vanished {
            self.inbound.remove(&key);
            self.registration_failures.remove(&key);
            self.registration_given_up.remove(&key);
            if let Some(registration) = self.inbound_registrations.remove(&key) {
                if let Err(e) = adapter.unregister(&registration.local_node_name) {
                    log::warn!("unregister({}) failed: {e}", registration.local_node_name);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_register(
        &mut self,
        key: FlipKey,
        connection: Connection,
        source_gateway: String,
        local_name: &str,
        adapter: &dyn LocalAdapter,
        retry_limit: u32,
    ) {
        let local_node_name = Registration::synthetic_node_name(local_name, &source_gateway, &connection.name);
        match adapter.register(&connection, &local_node_name) {
            Ok(_) => {
                self.registration_failures.remove(&key);
                self.inbound_registrations.insert(key, Registration::new(connection, source_gateway, local_node_name));
            }
            Err(e) => {
                let count = self.registration_failures.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count >= retry_limit {
                    log::warn!("register({local_node_name}) failed {count} times, giving up: {e}");
                    self.registration_failures.remove(&key);
                    self.registration_given_up.insert(key, ());
                } else {
                    log::warn!("register({local_node_name}) failed ({count}/{retry_limit}): {e}");
                }
            }
        }
    }
}
