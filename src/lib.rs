//! Gateway synchronization engine: federates multiple independent
//! publish/subscribe/RPC namespaces across a network by running a gateway
//! alongside each local namespace and connecting every gateway to a shared
//! hub. This crate is the core: the in-memory state that
//! decides which endpoints cross the boundary in each direction, the
//! watcher that reconciles this state with the live local namespace and the
//! hub directory, the flip protocol (encryption plus its
//! pending/accepted/blocked state machine), and the hub client that
//! persists all of this into the shared directory while remaining resilient
//! to hub loss.
//!
//! Deliberately out of scope: the local-namespace adapter
//! that enumerates topics/services/actions (its contract lives in
//! [`adapter::LocalAdapter`]), the transport-level RPC surface operators use
//! to drive a gateway, CLI entry points, configuration file parsing, and the
//! hub process itself.

pub mod adapter;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod hub;
pub mod interfaces;
pub mod registration;
pub mod rule_store;
pub mod watcher;

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionType, RemoteRule, Rule, RuleSet};
pub use engine::{GatewayEngine, GatewayInfo, ReconnectFactory};
pub use error::{GatewayError, GatewayResult};
pub use registration::Registration;
pub use rule_store::RuleStore;
