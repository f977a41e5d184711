//! The connection model: [`ConnectionType`], [`Connection`], [`Rule`] and the
//! matching relation between them.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::GatewayError;

/// Basename of a node URI/name, shared by [`Connection::node_basename`] and
/// rule matching against the still-encrypted form of a connection (`name`,
/// `node_uri` and `type` stay in clear on the wire, only `type_info` and
/// `transport_uri` are encrypted -- see [`crate::crypto`]).
pub fn node_basename_of(node_uri: &str) -> &str {
    node_uri.rsplit('/').next().unwrap_or(node_uri)
}

/// One of the five endpoint kinds a local namespace can expose. An action
/// expands on the wire to five underlying pub/sub + service endpoints (see
/// [`ConnectionType::action_sub_kinds`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ConnectionType {
    Publisher = 0,
    Subscriber = 1,
    Service = 2,
    ActionClient = 3,
    ActionServer = 4,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Publisher => "publisher",
            ConnectionType::Subscriber => "subscriber",
            ConnectionType::Service => "service",
            ConnectionType::ActionClient => "action_client",
            ConnectionType::ActionServer => "action_server",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, GatewayError> {
        match s {
            "publisher" => Ok(ConnectionType::Publisher),
            "subscriber" => Ok(ConnectionType::Subscriber),
            "service" => Ok(ConnectionType::Service),
            "action_client" => Ok(ConnectionType::ActionClient),
            "action_server" => Ok(ConnectionType::ActionServer),
            other => Err(GatewayError::ConnectionTypeError {
                found: other.to_string(),
            }),
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, ConnectionType::ActionClient | ConnectionType::ActionServer)
    }

    /// The five sub-endpoints an action type expands to, each tagged with
    /// its own underlying pub/sub-or-service kind and name suffix. Direction
    /// (client vs. server) flips which side publishes `/goal` and `/cancel`
    /// versus `/feedback`, `/status` and `/result`.
    pub fn action_sub_kinds(&self) -> [(ConnectionType, &'static str); 5] {
        match self {
            ConnectionType::ActionClient => [
                (ConnectionType::Publisher, "/goal"),
                (ConnectionType::Publisher, "/cancel"),
                (ConnectionType::Subscriber, "/feedback"),
                (ConnectionType::Subscriber, "/status"),
                (ConnectionType::Subscriber, "/result"),
            ],
            ConnectionType::ActionServer => [
                (ConnectionType::Subscriber, "/goal"),
                (ConnectionType::Subscriber, "/cancel"),
                (ConnectionType::Publisher, "/feedback"),
                (ConnectionType::Publisher, "/status"),
                (ConnectionType::Publisher, "/result"),
            ],
            other => panic!("action_sub_kinds called on non-action type {other:?}"),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete live endpoint. Produced by the local adapter or decoded from
/// the hub -- never invented by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub kind: ConnectionType,
    pub name: String,
    pub node_uri: String,
    pub type_info: String,
    pub transport_uri: String,
}

impl Connection {
    pub fn new(
        kind: ConnectionType,
        name: impl Into<String>,
        node_uri: impl Into<String>,
        type_info: impl Into<String>,
        transport_uri: impl Into<String>,
    ) -> Self {
        Connection {
            kind,
            name: name.into(),
            node_uri: node_uri.into(),
            type_info: type_info.into(),
            transport_uri: transport_uri.into(),
        }
    }

    /// The `node_uri`'s basename, used for node-pattern matching.
    pub fn node_basename(&self) -> &str {
        node_basename_of(&self.node_uri)
    }

    /// Deterministic, type-tagged tuple encoding for the hub. Round-trips
    /// exactly through [`Connection::from_wire`].
    pub fn to_wire(&self) -> String {
        serde_json::to_string(&(
            self.kind,
            &self.name,
            &self.node_uri,
            &self.type_info,
            &self.transport_uri,
        ))
        .expect("tuple encoding of Connection never fails")
    }

    pub fn from_wire(s: &str) -> Result<Self, GatewayError> {
        let (kind, name, node_uri, type_info, transport_uri): (
            ConnectionType,
            String,
            String,
            String,
            String,
        ) = serde_json::from_str(s).map_err(|e| GatewayError::ConnectionTypeError {
            found: format!("malformed connection on wire: {e}"),
        })?;
        Ok(Connection {
            kind,
            name,
            node_uri,
            type_info,
            transport_uri,
        })
    }

    /// Derive the `action_name`/sub-kind-suffixed connection used when an
    /// action-typed rule expands to its five underlying endpoints.
    pub fn with_action_suffix(&self, kind: ConnectionType, suffix: &str) -> Connection {
        Connection {
            kind,
            name: format!("{}{}", self.name, suffix),
            node_uri: self.node_uri.clone(),
            type_info: self.type_info.clone(),
            transport_uri: self.transport_uri.clone(),
        }
    }
}

/// `Regex` isn't `PartialEq`, so rules compare and clone by source pattern
/// string -- two rules with the same source are equivalent regardless of
/// whatever internal compiled representation `regex` produces for them.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    pub fn new(source: impl Into<String>) -> Result<Self, GatewayError> {
        let source = source.into();
        let anchored = format!("^(?:{source})$");
        let regex = Regex::new(&anchored).map_err(|e| GatewayError::ConnectionTypeError {
            found: format!("bad pattern '{source}': {e}"),
        })?;
        Ok(CompiledPattern { source, regex })
    }

    pub fn wildcard() -> Self {
        Self::new(".*").expect("wildcard pattern always compiles")
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PartialEq for CompiledPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
impl Eq for CompiledPattern {}

/// `(type, name_pattern, node_pattern)` plus the `deny` flag. A Connection
/// matches when its type equals the rule's type, its name matches
/// `name_pattern`, and its node basename matches `node_pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: ConnectionType,
    pub name_pattern: CompiledPattern,
    pub node_pattern: CompiledPattern,
    pub deny: bool,
}

impl Rule {
    pub fn new(kind: ConnectionType, name_pattern: &str, node_pattern: &str) -> Result<Self, GatewayError> {
        Ok(Rule {
            kind,
            name_pattern: CompiledPattern::new(name_pattern)?,
            node_pattern: CompiledPattern::new(node_pattern)?,
            deny: false,
        })
    }

    pub fn denying(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        self.kind == connection.kind
            && self.name_pattern.is_match(&connection.name)
            && self.node_pattern.is_match(connection.node_basename())
    }

    /// Same matching relation, against the fields of a connection that are
    /// still in clear after encryption (`kind`, `name`, `node_uri`). Lets a
    /// gateway identify its own flip requests sitting in a remote's
    /// `flip_ins` set without needing that remote's private key.
    pub fn matches_encrypted(&self, kind: ConnectionType, name: &str, node_uri: &str) -> bool {
        self.kind == kind && self.name_pattern.is_match(name) && self.node_pattern.is_match(node_basename_of(node_uri))
    }

    /// Expand an action-typed rule into its five concrete sub-rules (see
    /// [`ConnectionType::action_sub_kinds`]); a non-action rule expands to
    /// itself. Matching against live/remote connections -- which are always
    /// one of the three concrete kinds, never `action_client`/`action_server`
    /// -- must go through this, not `matches` directly, or an action rule
    /// matches nothing.
    pub fn expand_action(&self) -> Vec<Rule> {
        if !self.kind.is_action() {
            return vec![self.clone()];
        }
        self.kind
            .action_sub_kinds()
            .into_iter()
            .filter_map(|(sub_kind, suffix)| {
                let name_pattern = CompiledPattern::new(format!("{}{}", self.name_pattern.source(), suffix)).ok()?;
                Some(Rule {
                    kind: sub_kind,
                    name_pattern,
                    node_pattern: self.node_pattern.clone(),
                    deny: self.deny,
                })
            })
            .collect()
    }

    /// Narrow serialization used in the debug-only `flips`/`pulls` sets:
    /// `[target, name, type, node]`. `type_info`/`transport_uri` never
    /// appear here.
    pub fn to_debug_tuple(&self, target_gateway: &str) -> (String, String, ConnectionType, String) {
        (
            target_gateway.to_string(),
            self.name_pattern.source().to_string(),
            self.kind,
            self.node_pattern.source().to_string(),
        )
    }
}

/// A ruleset accepts a Connection iff at least one non-deny rule matches and
/// no deny rule matches.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub whitelist: Vec<Rule>,
    pub blacklist: Vec<Rule>,
}

impl RuleSet {
    pub fn allow(&self, connection: &Connection) -> bool {
        self.whitelist.iter().any(|r| r.matches(connection))
            && !self.blacklist.iter().any(|r| r.matches(connection))
    }

    pub fn make_all_public(&mut self, kind: ConnectionType) {
        let wildcard = Rule {
            kind,
            name_pattern: CompiledPattern::wildcard(),
            node_pattern: CompiledPattern::wildcard(),
            deny: false,
        };
        if !self.whitelist.contains(&wildcard) {
            self.whitelist.push(wildcard);
        }
    }

    pub fn remove_all_public(&mut self, kind: ConnectionType) {
        let wildcard = Rule {
            kind,
            name_pattern: CompiledPattern::wildcard(),
            node_pattern: CompiledPattern::wildcard(),
            deny: false,
        };
        self.whitelist.retain(|r| r != &wildcard);
    }
}

/// A gateway name pattern used to resolve `RemoteRule::target_gateway`
/// against the hub's live gateway list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPattern(pub CompiledPattern);

impl GatewayPattern {
    pub fn new(source: &str) -> Result<Self, GatewayError> {
        Ok(GatewayPattern(CompiledPattern::new(source)?))
    }

    pub fn matches(&self, gateway_name: &str) -> bool {
        self.0.is_match(gateway_name)
    }
}

/// `(target_gateway, Rule)`. Used for flips and pulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRule {
    pub target_gateway: GatewayPattern,
    pub rule: Rule,
}

impl RemoteRule {
    pub fn new(target_gateway: &str, rule: Rule) -> Result<Self, GatewayError> {
        Ok(RemoteRule {
            target_gateway: GatewayPattern::new(target_gateway)?,
            rule,
        })
    }
}
