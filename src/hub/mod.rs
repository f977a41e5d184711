//! Everything to do with the shared hub: its key/channel schema, the client
//! that talks to it, the connection-health checker and the pub/sub listener.

pub mod checker;
pub mod client;
pub mod pubsub;
pub mod schema;

pub use checker::HubConnectionChecker;
pub use client::{HubClient, RedisHubClient};
pub use pubsub::{HubCommand, PubsubListener};
