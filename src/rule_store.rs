//! [`RuleStore`]: the engine's rule sets collected into a single explicit
//! value rather than scattered process-wide singletons. Command handlers
//! mutate it under the engine's rule-set mutex; the watcher takes the same
//! mutex for read-only snapshots during a tick.

use crate::connection::{Connection, RemoteRule, RuleSet};

/// All policy the engine acts on: what's public, what's flipped out, what's
/// pulled in, and who's allowed to flip things in to us.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    pub public: RuleSet,
    pub flip: Vec<RemoteRule>,
    pub pull: Vec<RemoteRule>,
    pub accept_whitelist: Vec<RemoteRule>,
    pub accept_blacklist: Vec<RemoteRule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an inbound flip offer from `source_gateway` is accepted by the
    /// accept policy: a parallel whitelist/blacklist ruleset keyed by
    /// `(source_gateway pattern, rule)`.
    pub fn accepts_inbound(&self, source_gateway: &str, connection: &Connection) -> bool {
        let matches = |r: &RemoteRule| {
            r.target_gateway.matches(source_gateway) && r.rule.expand_action().iter().any(|sub| sub.matches(connection))
        };
        let whitelisted = self.accept_whitelist.iter().any(matches);
        let blacklisted = self.accept_blacklist.iter().any(matches);
        whitelisted && !blacklisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionType, Rule};

    fn conn(name: &str) -> Connection {
        Connection::new(ConnectionType::Service, name, "/g/node", "rocon_msgs/Add", "rosrpc://h:1")
    }

    #[test]
    fn accepts_inbound_requires_whitelist_hit_and_no_blacklist_hit() {
        let mut store = RuleStore::new();
        store.accept_whitelist.push(
            RemoteRule::new("G1", Rule::new(ConnectionType::Service, "/add", ".*").unwrap()).unwrap(),
        );
        assert!(store.accepts_inbound("G1", &conn("/add")));
        assert!(!store.accepts_inbound("G2", &conn("/add")));

        store.accept_blacklist.push(
            RemoteRule::new("G1", Rule::new(ConnectionType::Service, "/add", ".*").unwrap()).unwrap(),
        );
        assert!(!store.accepts_inbound("G1", &conn("/add")));
    }

    #[test]
    fn accepts_inbound_expands_an_action_typed_accept_rule() {
        let mut store = RuleStore::new();
        store.accept_whitelist.push(
            RemoteRule::new("G1", Rule::new(ConnectionType::ActionServer, "/fibonacci", ".*").unwrap()).unwrap(),
        );
        let goal = Connection::new(ConnectionType::Subscriber, "/fibonacci/goal", "/g/node", "rocon_msgs/Goal", "rosrpc://h:1");
        assert!(store.accepts_inbound("G1", &goal));
    }
}
