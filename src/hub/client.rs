//! The hub client: one instance per connected hub. Owns the TCP connection,
//! this gateway's per-hub `unique_name`, its RSA keypair, and the flip
//! protocol.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use redis::Commands;

use crate::connection::{Connection, ConnectionType, GatewayPattern, Rule};
use crate::crypto::{self, Keypair, PublicKey};
use crate::error::GatewayError;
use crate::hub::pubsub::HubCommand;
use crate::hub::schema::{self, fields, FlipStatus, GatewayDirectoryEntry, LatencyStats, NetworkStatistics, StoredFlipIn};

/// Everything the engine, watcher and interfaces need from a connected hub.
/// Implemented by [`RedisHubClient`] against a real hub; a `FakeHub` test
/// double under `#[cfg(test)]` implements the same trait for deterministic
/// unit tests.
pub trait HubClient: Send + Sync {
    fn ip(&self) -> &str;
    fn port(&self) -> u16;
    fn unique_name(&self) -> Option<String>;

    fn register_gateway(&self, firewall: bool, unresolved_name: &str, gateway_ip: &str) -> Result<String, GatewayError>;
    fn unregister_gateway(&self) -> Result<(), GatewayError>;

    fn advertise(&self, connection: &Connection) -> Result<(), GatewayError>;
    fn unadvertise(&self, connection: &Connection) -> Result<(), GatewayError>;

    fn post_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError>;
    fn remove_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError>;
    fn post_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError>;
    fn remove_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError>;

    fn list_remote_gateway_names(&self) -> Result<Vec<String>, GatewayError>;
    fn matches_remote_gateway_name(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError>;
    fn matches_remote_gateway_basename(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError>;
    fn remote_gateway_info(&self, gateway: &str) -> Result<Option<GatewayDirectoryEntry>, GatewayError>;
    fn get_remote_connection_state(&self, gateway: &str) -> Result<HashMap<ConnectionType, Vec<Connection>>, GatewayError>;
    fn get_remote_gateway_firewall_flag(&self, gateway: &str) -> Result<bool, GatewayError>;

    fn publish_network_statistics(&self, stats: &NetworkStatistics, latency: &LatencyStats) -> Result<(), GatewayError>;
    fn refresh_ping(&self) -> Result<(), GatewayError>;
    fn application_health_check(&self) -> Result<(), GatewayError>;

    fn send_flip_request(&self, remote_gateway: &str, connection: &Connection, timeout: Duration) -> Result<bool, GatewayError>;
    fn send_unflip_request(&self, remote_gateway: &str, rule: &Rule) -> Result<(), GatewayError> {
        for sub_rule in rule.expand_action() {
            self.send_unflip_request_single(remote_gateway, &sub_rule)?;
        }
        Ok(())
    }
    fn send_unflip_request_single(&self, remote_gateway: &str, rule: &Rule) -> Result<(), GatewayError>;

    fn get_unblocked_flipped_in_connections(&self) -> Result<Vec<(Connection, String)>, GatewayError>;
    fn update_flip_request_status(&self, connection: &Connection, source_gateway: &str, status: FlipStatus) -> Result<bool, GatewayError>;
    fn get_flip_request_status(&self, remote_gateway: &str, rule: &Rule, source_gateway: Option<&str>) -> Result<Option<FlipStatus>, GatewayError>;

    /// Push a `[command, source, args]` notification onto `target_gateway`'s
    /// personal pub/sub channel. `flip_ins`/removal is the data of record;
    /// this only wakes up a subscriber that might otherwise wait a full
    /// watcher tick to notice it. A missed notification is not a correctness
    /// bug, only added latency, so the default is a no-op.
    fn notify(&self, _target_gateway: &str, _command: HubCommand) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Start listening on this gateway's personal pub/sub channel, pushing
    /// every decoded [`HubCommand`] onto `sender`. Returns `None` when the
    /// hub has no pub/sub transport to subscribe on (not yet registered, or
    /// a test double that relies purely on the watcher's polling tick).
    /// Dropping the returned listener stops its thread.
    fn subscribe_personal_channel(&self, _sender: std::sync::mpsc::SyncSender<HubCommand>) -> Option<crate::hub::pubsub::PubsubListener> {
        None
    }
}

/// A real hub client, backed by a blocking `redis` connection. One instance
/// guards one TCP connection.
pub struct RedisHubClient {
    ip: String,
    port: u16,
    client: redis::Client,
    conn: Mutex<redis::Connection>,
    unique_name: Mutex<Option<String>>,
    keypair: Mutex<Option<Keypair>>,
}

impl RedisHubClient {
    pub fn connect(ip: &str, port: u16) -> Result<Self, GatewayError> {
        let url = format!("redis://{ip}:{port}");
        let client = redis::Client::open(url).map_err(|_| GatewayError::HubNotFound {
            ip: ip.to_string(),
            port,
        })?;
        let conn = client.get_connection().map_err(|_| GatewayError::HubNotFound {
            ip: ip.to_string(),
            port,
        })?;
        Ok(RedisHubClient {
            ip: ip.to_string(),
            port,
            client,
            conn: Mutex::new(conn),
            unique_name: Mutex::new(None),
            keypair: Mutex::new(None),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>) -> Result<T, GatewayError> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn).map_err(|_| GatewayError::HubConnectionLost)
    }

    fn gateway_key_or_err(&self) -> Result<String, GatewayError> {
        self.unique_name
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::HubConnectionLost)
    }

    fn keypair_or_err(&self) -> Result<(), GatewayError> {
        if self.keypair.lock().unwrap().is_none() {
            return Err(GatewayError::HubConnectionLost);
        }
        Ok(())
    }
}

impl HubClient for RedisHubClient {
    fn ip(&self) -> &str {
        &self.ip
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn unique_name(&self) -> Option<String> {
        self.unique_name.lock().unwrap().clone()
    }

    fn register_gateway(&self, firewall: bool, unresolved_name: &str, gateway_ip: &str) -> Result<String, GatewayError> {
        let existing = self.with_conn(|c| c.smembers::<_, Vec<String>>(schema::gatewaylist_key()))?;
        let mut candidate = unresolved_name.to_string();
        let mut rng = rand::rng();
        while existing.contains(&schema::gateway_root_key(&candidate)) {
            let suffix: u32 = rng.random_range(0..1_000_000);
            candidate = format!("{unresolved_name}_{suffix}");
        }

        let keypair = Keypair::generate()?;
        let public_pem = keypair.public_key_pem()?;

        self.with_conn(|c| {
            c.sadd::<_, _, ()>(schema::gatewaylist_key(), schema::gateway_root_key(&candidate))?;
            c.set::<_, _, ()>(schema::gateway_key(&candidate, fields::FIREWALL), if firewall { 1 } else { 0 })?;
            c.set::<_, _, ()>(schema::gateway_key(&candidate, fields::IP), gateway_ip)?;
            c.set::<_, _, ()>(schema::gateway_key(&candidate, fields::PUBLIC_KEY), public_pem.clone())?;
            c.set::<_, _, ()>(schema::gateway_key(&candidate, fields::AVAILABLE), "True")?;
            c.set::<_, _, ()>(schema::gateway_key(&candidate, fields::PING), true)?;
            c.expire::<_, ()>(schema::gateway_key(&candidate, fields::PING), schema::MAX_TTL as i64)
        })?;

        *self.unique_name.lock().unwrap() = Some(candidate.clone());
        *self.keypair.lock().unwrap() = Some(keypair);
        Ok(candidate)
    }

    fn unregister_gateway(&self) -> Result<(), GatewayError> {
        let name = match self.unique_name.lock().unwrap().clone() {
            Some(n) => n,
            None => return Ok(()),
        };
        // Best-effort: a hub that is already gone should not prevent shutdown.
        let _ = self.with_conn(|c| {
            let keys: Vec<String> = c.keys(format!("{}:*", schema::gateway_root_key(&name)))?;
            let mut pipe = redis::pipe();
            if !keys.is_empty() {
                pipe.del(keys);
            }
            pipe.srem(schema::gatewaylist_key(), schema::gateway_root_key(&name));
            pipe.query::<()>(c)
        });
        Ok(())
    }

    fn advertise(&self, connection: &Connection) -> Result<(), GatewayError> {
        let name = self.gateway_key_or_err()?;
        self.with_conn(|c| {
            c.sadd::<_, _, ()>(schema::gateway_key(&name, fields::ADVERTISEMENTS), connection.to_wire())
        })
    }

    fn unadvertise(&self, connection: &Connection) -> Result<(), GatewayError> {
        let name = self.gateway_key_or_err()?;
        self.with_conn(|c| {
            c.srem::<_, _, ()>(schema::gateway_key(&name, fields::ADVERTISEMENTS), connection.to_wire())
        })
    }

    fn post_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
        let own = self.gateway_key_or_err()?;
        let tuple = (target_gateway.to_string(), name.to_string(), kind, node.to_string());
        self.with_conn(|c| {
            c.sadd::<_, _, ()>(schema::gateway_key(&own, fields::FLIPS), schema::serialize_debug_tuple(&tuple))
        })
    }

    fn remove_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
        let own = self.gateway_key_or_err()?;
        let tuple = (target_gateway.to_string(), name.to_string(), kind, node.to_string());
        self.with_conn(|c| {
            c.srem::<_, _, ()>(schema::gateway_key(&own, fields::FLIPS), schema::serialize_debug_tuple(&tuple))
        })
    }

    fn post_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
        let own = self.gateway_key_or_err()?;
        let tuple = (source_gateway.to_string(), name.to_string(), kind, node.to_string());
        self.with_conn(|c| {
            c.sadd::<_, _, ()>(schema::gateway_key(&own, fields::PULLS), schema::serialize_debug_tuple(&tuple))
        })
    }

    fn remove_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
        let own = self.gateway_key_or_err()?;
        let tuple = (source_gateway.to_string(), name.to_string(), kind, node.to_string());
        self.with_conn(|c| {
            c.srem::<_, _, ()>(schema::gateway_key(&own, fields::PULLS), schema::serialize_debug_tuple(&tuple))
        })
    }

    fn list_remote_gateway_names(&self) -> Result<Vec<String>, GatewayError> {
        let own = self.unique_name();
        let members: Vec<String> = self.with_conn(|c| c.smembers(schema::gatewaylist_key()))?;
        Ok(members
            .into_iter()
            .map(|k| schema::key_base_name(&k))
            .filter(|name| Some(name.as_str()) != own.as_deref())
            .collect())
    }

    fn matches_remote_gateway_name(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .list_remote_gateway_names()?
            .into_iter()
            .filter(|name| pattern.matches(name))
            .collect())
    }

    fn matches_remote_gateway_basename(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .list_remote_gateway_names()?
            .into_iter()
            .filter(|name| {
                let basename = name.rsplit('/').next().unwrap_or(name.as_str());
                pattern.matches(basename)
            })
            .collect())
    }

    fn remote_gateway_info(&self, gateway: &str) -> Result<Option<GatewayDirectoryEntry>, GatewayError> {
        let firewall: Option<String> = self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::FIREWALL)))?;
        let firewall = match firewall {
            Some(v) => v,
            None => return Ok(None),
        };
        let ip: Option<String> = self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::IP)))?;
        let ip = match ip {
            Some(v) => v,
            None => return Ok(None),
        };

        let public_key_pem: Vec<u8> = self
            .with_conn(|c| c.get(schema::gateway_key(gateway, fields::PUBLIC_KEY)))
            .unwrap_or_default();

        let advertisement_wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(gateway, fields::ADVERTISEMENTS)))?;
        let public_interface = advertisement_wires
            .iter()
            .filter_map(|w| Connection::from_wire(w).ok())
            .collect();

        let flip_wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(gateway, fields::FLIPS)))?;
        let flips = flip_wires.iter().filter_map(|w| schema::deserialize_debug_tuple(w)).collect();

        let pull_wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(gateway, fields::PULLS)))?;
        let pulls = pull_wires.iter().filter_map(|w| schema::deserialize_debug_tuple(w)).collect();

        let flip_in_wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(gateway, fields::FLIP_INS)))?;
        let flip_ins = flip_in_wires.iter().filter_map(|w| StoredFlipIn::from_wire(w)).collect();

        let available: Option<String> = self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::AVAILABLE)))?;
        let time_since_last_seen: Option<i64> = self
            .with_conn(|c| c.get(schema::gateway_key(gateway, fields::TIME_SINCE_LAST_SEEN)))
            .unwrap_or(None);

        let latency = LatencyStats {
            min: parse_f64(&self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::LATENCY_MIN)))?),
            avg: parse_f64(&self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::LATENCY_AVG)))?),
            max: parse_f64(&self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::LATENCY_MAX)))?),
            mdev: parse_f64(&self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::LATENCY_MDEV)))?),
        };

        Ok(Some(GatewayDirectoryEntry {
            firewall: firewall != "0",
            ip,
            public_key_pem,
            public_interface,
            flips,
            pulls,
            flip_ins,
            available: available.as_deref() == Some("True") || available.as_deref() == Some("true") || available.as_deref() == Some("1"),
            time_since_last_seen: time_since_last_seen.unwrap_or(0),
            latency,
        }))
    }

    fn get_remote_connection_state(&self, gateway: &str) -> Result<HashMap<ConnectionType, Vec<Connection>>, GatewayError> {
        let wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(gateway, fields::ADVERTISEMENTS)))?;
        let mut out: HashMap<ConnectionType, Vec<Connection>> = HashMap::new();
        for wire in wires {
            if let Ok(conn) = Connection::from_wire(&wire) {
                out.entry(conn.kind).or_default().push(conn);
            }
        }
        Ok(out)
    }

    fn get_remote_gateway_firewall_flag(&self, gateway: &str) -> Result<bool, GatewayError> {
        let firewall: Option<String> = self.with_conn(|c| c.get(schema::gateway_key(gateway, fields::FIREWALL)))?;
        match firewall {
            Some(v) => Ok(v != "0"),
            None => Err(GatewayError::GatewayUnavailable {
                gateway: gateway.to_string(),
            }),
        }
    }

    fn publish_network_statistics(&self, stats: &NetworkStatistics, latency: &LatencyStats) -> Result<(), GatewayError> {
        let name = self.gateway_key_or_err()?;
        self.with_conn(|c| {
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::NETWORK_INFO_AVAILABLE), stats.network_info_available)?;
            if !stats.network_info_available {
                return Ok(());
            }
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::NETWORK_TYPE), if stats.wired { "wired" } else { "wireless" })?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::PING), true)?;
            c.expire::<_, ()>(schema::gateway_key(&name, fields::PING), schema::MAX_TTL as i64)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::LATENCY_MIN), latency.min)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::LATENCY_AVG), latency.avg)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::LATENCY_MAX), latency.max)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::LATENCY_MDEV), latency.mdev)?;
            if stats.wired {
                return Ok(());
            }
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::WIRELESS_BITRATE), stats.wireless_bitrate)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::WIRELESS_QUALITY), stats.wireless_link_quality)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::WIRELESS_SIGNAL_LEVEL), stats.wireless_signal_level)?;
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::WIRELESS_NOISE_LEVEL), stats.wireless_noise_level)
        })
    }

    fn refresh_ping(&self) -> Result<(), GatewayError> {
        let name = self.gateway_key_or_err()?;
        self.with_conn(|c| {
            c.set::<_, _, ()>(schema::gateway_key(&name, fields::PING), true)?;
            c.expire::<_, ()>(schema::gateway_key(&name, fields::PING), schema::MAX_TTL as i64)
        })
    }

    fn application_health_check(&self) -> Result<(), GatewayError> {
        self.with_conn(|c| redis::cmd("PING").query::<String>(c)).map(|_| ())
    }

    fn send_flip_request(&self, remote_gateway: &str, connection: &Connection, timeout: Duration) -> Result<bool, GatewayError> {
        self.keypair_or_err()?;
        let own_name = self.gateway_key_or_err()?;

        let deadline = Instant::now() + timeout;
        let public_key = loop {
            let pem: Option<Vec<u8>> = self.with_conn(|c| c.get(schema::gateway_key(remote_gateway, fields::PUBLIC_KEY)))?;
            if let Some(pem) = pem {
                break PublicKey::from_pem(&pem)?;
            }
            if Instant::now() >= deadline {
                log::error!("flip to {remote_gateway} failed: public key not found within timeout");
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        let encrypted = crypto::encrypt_connection(connection, &public_key)?;
        let stored = StoredFlipIn {
            status: FlipStatus::Pending,
            source_gateway: own_name.clone(),
            encrypted_connection: encrypted,
        };
        self.with_conn(|c| {
            c.sadd::<_, _, ()>(schema::gateway_key(remote_gateway, fields::FLIP_INS), stored.to_wire())
        })?;
        self.notify(
            remote_gateway,
            HubCommand::Flip {
                source_gateway: own_name,
                name: connection.name.clone(),
                node_uri: connection.node_uri.clone(),
                kind: connection.kind,
            },
        )?;
        Ok(true)
    }

    fn send_unflip_request_single(&self, remote_gateway: &str, rule: &Rule) -> Result<(), GatewayError> {
        let own_name = self.gateway_key_or_err()?;
        let key = schema::gateway_key(remote_gateway, fields::FLIP_INS);
        let wires: Vec<String> = self.with_conn(|c| c.smembers(key.clone()))?;
        for wire in wires {
            let Some(stored) = StoredFlipIn::from_wire(&wire) else { continue };
            if stored.source_gateway != own_name {
                continue;
            }
            // The remote gateway encrypted this entry with its own public
            // key; we can only compare it by the fields that stayed in clear.
            let ec = &stored.encrypted_connection;
            if rule.matches_encrypted(ec.kind, &ec.name, &ec.node_uri) {
                self.with_conn(|c| c.srem::<_, _, ()>(key.clone(), wire.clone()))?;
                self.notify(
                    remote_gateway,
                    HubCommand::Unflip {
                        source_gateway: own_name.clone(),
                        name: ec.name.clone(),
                        node_uri: ec.node_uri.clone(),
                        kind: ec.kind,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn notify(&self, target_gateway: &str, command: HubCommand) -> Result<(), GatewayError> {
        self.with_conn(|c| redis::cmd("PUBLISH").arg(schema::pubsub_channel(target_gateway)).arg(command.to_wire()).query::<i64>(c))
            .map(|_| ())
    }

    fn subscribe_personal_channel(&self, sender: std::sync::mpsc::SyncSender<HubCommand>) -> Option<crate::hub::pubsub::PubsubListener> {
        let own_name = self.unique_name()?;
        crate::hub::pubsub::PubsubListener::spawn(self.client.clone(), own_name, sender).ok()
    }

    fn get_unblocked_flipped_in_connections(&self) -> Result<Vec<(Connection, String)>, GatewayError> {
        self.keypair_or_err()?;
        let own_name = self.gateway_key_or_err()?;
        let wires: Vec<String> = self
            .with_conn(|c| c.smembers(schema::gateway_key(&own_name, fields::FLIP_INS)))
            .unwrap_or_default();
        let keypair = self.keypair.lock().unwrap();
        let keypair = keypair.as_ref().unwrap();
        let mut out = Vec::new();
        for wire in wires {
            let Some(stored) = StoredFlipIn::from_wire(&wire) else { continue };
            if stored.status == FlipStatus::Blocked {
                continue;
            }
            if let Ok(connection) = crypto::decrypt_connection(&stored.encrypted_connection, keypair) {
                out.push((connection, stored.source_gateway));
            }
        }
        Ok(out)
    }

    fn update_flip_request_status(&self, connection: &Connection, source_gateway: &str, status: FlipStatus) -> Result<bool, GatewayError> {
        self.keypair_or_err()?;
        let own_name = self.gateway_key_or_err()?;
        let key = schema::gateway_key(&own_name, fields::FLIP_INS);
        let wires: Vec<String> = self.with_conn(|c| c.smembers(key.clone()))?;

        let mut found = false;
        let keypair_guard = self.keypair.lock().unwrap();
        let keypair = keypair_guard.as_ref().unwrap();
        for wire in &wires {
            let Some(stored) = StoredFlipIn::from_wire(wire) else { continue };
            if stored.source_gateway != source_gateway {
                continue;
            }
            let Ok(decrypted) = crypto::decrypt_connection(&stored.encrypted_connection, keypair) else { continue };
            if &decrypted == connection {
                self.with_conn(|c| c.srem::<_, _, ()>(key.clone(), wire.clone()))?;
                found = true;
            }
        }

        if found {
            // Re-encrypt with our own public key: a storage convention so we
            // remain the only reader of our own flip_ins, not a security
            // boundary (see design notes).
            let own_public = keypair.public_key()?;
            let re_encrypted = crypto::encrypt_connection(connection, &own_public)?;
            let stored = StoredFlipIn {
                status,
                source_gateway: source_gateway.to_string(),
                encrypted_connection: re_encrypted,
            };
            self.with_conn(|c| c.sadd::<_, _, ()>(key, stored.to_wire()))?;
        }
        Ok(found)
    }

    fn get_flip_request_status(&self, remote_gateway: &str, rule: &Rule, source_gateway: Option<&str>) -> Result<Option<FlipStatus>, GatewayError> {
        let own_name = self.unique_name();
        let wanted_source = source_gateway.map(str::to_string).or(own_name);
        let Some(wanted_source) = wanted_source else {
            return Ok(None);
        };
        let wires: Vec<String> = self.with_conn(|c| c.smembers(schema::gateway_key(remote_gateway, fields::FLIP_INS)))?;
        for wire in wires {
            let Some(stored) = StoredFlipIn::from_wire(&wire) else { continue };
            if stored.source_gateway != wanted_source {
                continue;
            }
            // Name and type remain in clear, so a rule restricted to those
            // can be checked without decryption.
            if rule.name_pattern.is_match(&stored.encrypted_connection.name) && rule.kind == stored.encrypted_connection.kind {
                return Ok(Some(stored.status));
            }
        }
        Ok(None)
    }
}

fn parse_f64(v: &Option<String>) -> f64 {
    v.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0)
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;

    /// An in-memory stand-in for the hub's key/value + pub/sub store,
    /// implementing [`HubClient`] against a `HashMap`-backed directory
    /// instead of a real Redis connection. Lets tests drive end-to-end
    /// scenarios deterministically.
    pub struct FakeHub {
        pub ip: String,
        pub port: u16,
        pub unique_name: Mutex<Option<String>>,
        pub keypair: Mutex<Option<Keypair>>,
        pub gateways: Mutex<HashMap<String, FakeGatewayRecord>>,
        /// `(target_gateway, command)` pairs passed to `notify`, in order. Lets
        /// tests assert a flip/unflip was announced, not just stored.
        pub notifications: Mutex<Vec<(String, HubCommand)>>,
        /// Flipped by tests to make `application_health_check` fail, so the
        /// connection checker's loss path can be exercised deterministically.
        pub healthy: Mutex<bool>,
    }

    #[derive(Default, Clone)]
    pub struct FakeGatewayRecord {
        pub firewall: bool,
        pub ip: String,
        pub public_key_pem: Vec<u8>,
        pub advertisements: Vec<String>,
        pub flips: Vec<(String, String, ConnectionType, String)>,
        pub pulls: Vec<(String, String, ConnectionType, String)>,
        pub flip_ins: Vec<StoredFlipIn>,
    }

    impl FakeHub {
        pub fn new(ip: &str, port: u16) -> Self {
            FakeHub {
                ip: ip.to_string(),
                port,
                unique_name: Mutex::new(None),
                keypair: Mutex::new(None),
                gateways: Mutex::new(HashMap::new()),
                notifications: Mutex::new(Vec::new()),
                healthy: Mutex::new(true),
            }
        }

        pub fn set_healthy(&self, healthy: bool) {
            *self.healthy.lock().unwrap() = healthy;
        }

        fn own(&self) -> Result<String, GatewayError> {
            self.unique_name.lock().unwrap().clone().ok_or(GatewayError::HubConnectionLost)
        }
    }

    impl HubClient for FakeHub {
        fn ip(&self) -> &str {
            &self.ip
        }

        fn port(&self) -> u16 {
            self.port
        }

        fn unique_name(&self) -> Option<String> {
            self.unique_name.lock().unwrap().clone()
        }

        fn register_gateway(&self, firewall: bool, unresolved_name: &str, gateway_ip: &str) -> Result<String, GatewayError> {
            let mut gateways = self.gateways.lock().unwrap();
            let mut candidate = unresolved_name.to_string();
            let mut suffix = 0u32;
            while gateways.contains_key(&candidate) {
                candidate = format!("{unresolved_name}_{suffix}");
                suffix += 1;
            }
            let keypair = Keypair::generate()?;
            let record = FakeGatewayRecord {
                firewall,
                ip: gateway_ip.to_string(),
                public_key_pem: keypair.public_key_pem()?,
                ..Default::default()
            };
            gateways.insert(candidate.clone(), record);
            *self.unique_name.lock().unwrap() = Some(candidate.clone());
            *self.keypair.lock().unwrap() = Some(keypair);
            Ok(candidate)
        }

        fn unregister_gateway(&self) -> Result<(), GatewayError> {
            if let Some(name) = self.unique_name.lock().unwrap().take() {
                self.gateways.lock().unwrap().remove(&name);
            }
            Ok(())
        }

        fn advertise(&self, connection: &Connection) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let wire = connection.to_wire();
            if !rec.advertisements.contains(&wire) {
                rec.advertisements.push(wire);
            }
            Ok(())
        }

        fn unadvertise(&self, connection: &Connection) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let wire = connection.to_wire();
            rec.advertisements.retain(|w| w != &wire);
            Ok(())
        }

        fn post_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let tuple = (target_gateway.to_string(), name.to_string(), kind, node.to_string());
            if !rec.flips.contains(&tuple) {
                rec.flips.push(tuple);
            }
            Ok(())
        }

        fn remove_flip_details(&self, target_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let tuple = (target_gateway.to_string(), name.to_string(), kind, node.to_string());
            rec.flips.retain(|t| t != &tuple);
            Ok(())
        }

        fn post_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let tuple = (source_gateway.to_string(), name.to_string(), kind, node.to_string());
            if !rec.pulls.contains(&tuple) {
                rec.pulls.push(tuple);
            }
            Ok(())
        }

        fn remove_pull_details(&self, source_gateway: &str, name: &str, kind: ConnectionType, node: &str) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let rec = gateways.get_mut(&own).ok_or(GatewayError::HubConnectionLost)?;
            let tuple = (source_gateway.to_string(), name.to_string(), kind, node.to_string());
            rec.pulls.retain(|t| t != &tuple);
            Ok(())
        }

        fn list_remote_gateway_names(&self) -> Result<Vec<String>, GatewayError> {
            let own = self.unique_name();
            Ok(self
                .gateways
                .lock()
                .unwrap()
                .keys()
                .filter(|name| Some(name.as_str()) != own.as_deref())
                .cloned()
                .collect())
        }

        fn matches_remote_gateway_name(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError> {
            Ok(self.list_remote_gateway_names()?.into_iter().filter(|n| pattern.matches(n)).collect())
        }

        fn matches_remote_gateway_basename(&self, pattern: &GatewayPattern) -> Result<Vec<String>, GatewayError> {
            self.matches_remote_gateway_name(pattern)
        }

        fn remote_gateway_info(&self, gateway: &str) -> Result<Option<GatewayDirectoryEntry>, GatewayError> {
            let gateways = self.gateways.lock().unwrap();
            let Some(rec) = gateways.get(gateway) else { return Ok(None) };
            Ok(Some(GatewayDirectoryEntry {
                firewall: rec.firewall,
                ip: rec.ip.clone(),
                public_key_pem: rec.public_key_pem.clone(),
                public_interface: rec.advertisements.iter().filter_map(|w| Connection::from_wire(w).ok()).collect(),
                flips: rec.flips.clone(),
                pulls: rec.pulls.clone(),
                flip_ins: rec.flip_ins.clone(),
                available: true,
                time_since_last_seen: 0,
                latency: LatencyStats::default(),
            }))
        }

        fn get_remote_connection_state(&self, gateway: &str) -> Result<HashMap<ConnectionType, Vec<Connection>>, GatewayError> {
            let gateways = self.gateways.lock().unwrap();
            let mut out = HashMap::new();
            if let Some(rec) = gateways.get(gateway) {
                for wire in &rec.advertisements {
                    if let Ok(conn) = Connection::from_wire(wire) {
                        out.entry(conn.kind).or_insert_with(Vec::new).push(conn);
                    }
                }
            }
            Ok(out)
        }

        fn get_remote_gateway_firewall_flag(&self, gateway: &str) -> Result<bool, GatewayError> {
            self.gateways
                .lock()
                .unwrap()
                .get(gateway)
                .map(|r| r.firewall)
                .ok_or_else(|| GatewayError::GatewayUnavailable { gateway: gateway.to_string() })
        }

        fn publish_network_statistics(&self, _stats: &NetworkStatistics, _latency: &LatencyStats) -> Result<(), GatewayError> {
            Ok(())
        }

        fn refresh_ping(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        fn application_health_check(&self) -> Result<(), GatewayError> {
            if *self.healthy.lock().unwrap() {
                Ok(())
            } else {
                Err(GatewayError::HubConnectionLost)
            }
        }

        fn send_flip_request(&self, remote_gateway: &str, connection: &Connection, _timeout: Duration) -> Result<bool, GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let Some(target) = gateways.get(remote_gateway).cloned() else {
                return Ok(false);
            };
            if target.public_key_pem.is_empty() {
                return Ok(false);
            }
            let public_key = PublicKey::from_pem(&target.public_key_pem)?;
            let encrypted = crypto::encrypt_connection(connection, &public_key)?;
            let rec = gateways.get_mut(remote_gateway).unwrap();
            rec.flip_ins.push(StoredFlipIn {
                status: FlipStatus::Pending,
                source_gateway: own.clone(),
                encrypted_connection: encrypted,
            });
            drop(gateways);
            self.notify(
                remote_gateway,
                HubCommand::Flip {
                    source_gateway: own,
                    name: connection.name.clone(),
                    node_uri: connection.node_uri.clone(),
                    kind: connection.kind,
                },
            )?;
            Ok(true)
        }

        fn send_unflip_request_single(&self, remote_gateway: &str, rule: &Rule) -> Result<(), GatewayError> {
            let own = self.own()?;
            let mut gateways = self.gateways.lock().unwrap();
            let Some(rec) = gateways.get_mut(remote_gateway) else { return Ok(()) };
            let mut removed = Vec::new();
            rec.flip_ins.retain(|stored| {
                if stored.source_gateway != own {
                    return true;
                }
                let ec = &stored.encrypted_connection;
                if rule.matches_encrypted(ec.kind, &ec.name, &ec.node_uri) {
                    removed.push((ec.name.clone(), ec.node_uri.clone(), ec.kind));
                    false
                } else {
                    true
                }
            });
            drop(gateways);
            for (name, node_uri, kind) in removed {
                self.notify(
                    remote_gateway,
                    HubCommand::Unflip {
                        source_gateway: own.clone(),
                        name,
                        node_uri,
                        kind,
                    },
                )?;
            }
            Ok(())
        }

        fn notify(&self, target_gateway: &str, command: HubCommand) -> Result<(), GatewayError> {
            self.notifications.lock().unwrap().push((target_gateway.to_string(), command));
            Ok(())
        }

        fn get_unblocked_flipped_in_connections(&self) -> Result<Vec<(Connection, String)>, GatewayError> {
            let own = self.own()?;
            let keypair_guard = self.keypair.lock().unwrap();
            let keypair = keypair_guard.as_ref().unwrap();
            let gateways = self.gateways.lock().unwrap();
            let Some(rec) = gateways.get(&own) else { return Ok(Vec::new()) };
            Ok(rec
                .flip_ins
                .iter()
                .filter(|s| s.status != FlipStatus::Blocked)
                .filter_map(|s| crypto::decrypt_connection(&s.encrypted_connection, keypair).ok().map(|c| (c, s.source_gateway.clone())))
                .collect())
        }

        fn update_flip_request_status(&self, connection: &Connection, source_gateway: &str, status: FlipStatus) -> Result<bool, GatewayError> {
            let own = self.own()?;
            let keypair_guard = self.keypair.lock().unwrap();
            let keypair = keypair_guard.as_ref().unwrap();
            let mut gateways = self.gateways.lock().unwrap();
            let Some(rec) = gateways.get_mut(&own) else { return Ok(false) };

            let mut found = false;
            rec.flip_ins.retain(|stored| {
                if stored.source_gateway != source_gateway {
                    return true;
                }
                match crypto::decrypt_connection(&stored.encrypted_connection, keypair) {
                    Ok(decrypted) if &decrypted == connection => {
                        found = true;
                        false
                    }
                    _ => true,
                }
            });

            if found {
                let own_public = keypair.public_key()?;
                let re_encrypted = crypto::encrypt_connection(connection, &own_public)?;
                rec.flip_ins.push(StoredFlipIn {
                    status,
                    source_gateway: source_gateway.to_string(),
                    encrypted_connection: re_encrypted,
                });
            }
            Ok(found)
        }

        fn get_flip_request_status(&self, remote_gateway: &str, rule: &Rule, source_gateway: Option<&str>) -> Result<Option<FlipStatus>, GatewayError> {
            let own_name = self.unique_name();
            let wanted_source = source_gateway.map(str::to_string).or(own_name);
            let Some(wanted_source) = wanted_source else { return Ok(None) };
            let gateways = self.gateways.lock().unwrap();
            let Some(rec) = gateways.get(remote_gateway) else { return Ok(None) };
            for stored in &rec.flip_ins {
                if stored.source_gateway != wanted_source {
                    continue;
                }
                if rule.name_pattern.is_match(&stored.encrypted_connection.name) && rule.kind == stored.encrypted_connection.kind {
                    return Ok(Some(stored.status));
                }
            }
            Ok(None)
        }
    }
}
