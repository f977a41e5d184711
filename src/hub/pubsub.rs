//! Subscriber thread for this gateway's `rocon:<gateway>` pub/sub channel.
//! Relays flip/unflip notifications pushed by remote gateways into a bounded
//! queue the engine drains on its own thread, so the subscriber thread never
//! calls back into engine state directly, breaking the reference cycle
//! between hub and engine.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use redis::Client;

use crate::connection::{Connection, ConnectionType};
use crate::hub::schema::pubsub_channel;

/// A command pushed by a remote gateway over the pub/sub channel:
/// `[command, source, args]` where `command` is `flip` or `unflip` and `args`
/// is `(name, node_uri, kind)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    Flip {
        source_gateway: String,
        name: String,
        node_uri: String,
        kind: ConnectionType,
    },
    Unflip {
        source_gateway: String,
        name: String,
        node_uri: String,
        kind: ConnectionType,
    },
}

type WireArgs = (String, String, ConnectionType);
type WireTuple = (String, String, WireArgs);

impl HubCommand {
    pub fn to_wire(&self) -> String {
        let tuple: WireTuple = match self {
            HubCommand::Flip { source_gateway, name, node_uri, kind } => {
                ("flip".to_string(), source_gateway.clone(), (name.clone(), node_uri.clone(), *kind))
            }
            HubCommand::Unflip { source_gateway, name, node_uri, kind } => {
                ("unflip".to_string(), source_gateway.clone(), (name.clone(), node_uri.clone(), *kind))
            }
        };
        serde_json::to_string(&tuple).expect("HubCommand always encodes")
    }

    pub fn from_wire(payload: &str) -> Option<Self> {
        let (command, source_gateway, (name, node_uri, kind)): WireTuple = serde_json::from_str(payload).ok()?;
        match command.as_str() {
            "flip" => Some(HubCommand::Flip { source_gateway, name, node_uri, kind }),
            "unflip" => Some(HubCommand::Unflip { source_gateway, name, node_uri, kind }),
            _ => None,
        }
    }
}

/// Owns the background subscriber thread for one hub. Dropping it unsubscribes
/// and joins the thread.
pub struct PubsubListener {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PubsubListener {
    /// Spawns the subscriber thread, pushing every decodable [`HubCommand`]
    /// onto `sender`. `sender` should be a bounded channel so a stalled
    /// engine applies backpressure instead of unbounded memory growth.
    pub fn spawn(client: Client, own_gateway: String, sender: SyncSender<HubCommand>) -> Result<Self, redis::RedisError> {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let channel = pubsub_channel(&own_gateway);

        let handle = std::thread::spawn(move || {
            loop {
                if stop_for_thread.load(std::sync::atomic::Ordering::Relaxed) {
                    return;
                }
                let conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_secs(1));
                        continue;
                    }
                };
                let mut pubsub = conn.into_pubsub();
                if pubsub.subscribe(&channel).is_err() {
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    continue;
                }

                loop {
                    if stop_for_thread.load(std::sync::atomic::Ordering::Relaxed) {
                        return;
                    }
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    let Ok(payload) = msg.get_payload::<String>() else { continue };
                    if let Some(command) = HubCommand::from_wire(&payload) {
                        if sender.send(command).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(PubsubListener {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for PubsubListener {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build a bounded command channel sized for one pub/sub listener. Exposed so
/// the engine can size and own the receiving end.
pub fn command_channel(capacity: usize) -> (SyncSender<HubCommand>, Receiver<HubCommand>) {
    std::sync::mpsc::sync_channel(capacity)
}

/// The connection a [`HubCommand`] refers to, with empty `type_info`/
/// `transport_uri` (those never travel over the wake-up channel, only the
/// `flip_ins`/`advertisements` sets carry them) -- enough to name the
/// connection in a log line.
pub(crate) fn describes_connection(command: &HubCommand) -> Connection {
    match command {
        HubCommand::Flip { name, node_uri, kind, .. } | HubCommand::Unflip { name, node_uri, kind, .. } => {
            Connection::new(*kind, name.clone(), node_uri.clone(), String::new(), String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_command_round_trips_through_wire_encoding() {
        let command = HubCommand::Flip {
            source_gateway: "gateway_a".to_string(),
            name: "/chatter".to_string(),
            node_uri: "/a/talker".to_string(),
            kind: ConnectionType::Publisher,
        };
        let wire = command.to_wire();
        assert_eq!(HubCommand::from_wire(&wire), Some(command));
    }

    #[test]
    fn malformed_payload_decodes_to_none() {
        assert_eq!(HubCommand::from_wire("not json"), None);
    }
}
