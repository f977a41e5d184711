//! The gateway engine: owns the three interfaces, the hub
//! clients, the rule store and the watcher; services operator commands.
//! Command handlers only ever mutate rule sets -- no command performs I/O
//! with a hub or the local adapter, that is the watcher's monopoly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::LocalAdapter;
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionType, RemoteRule, Rule};
use crate::error::GatewayResult;
use crate::hub::pubsub::{self, PubsubListener};
use crate::hub::schema::GatewayDirectoryEntry;
use crate::hub::{HubClient, HubConnectionChecker};
use crate::rule_store::RuleStore;
use crate::watcher::{Watcher, WatcherState};

/// Rebuilds a hub client for a hub lost to `on_connection_lost`. Production
/// callers pass a closure that dials `RedisHubClient::connect(ip, port)`
/// again; tests pass one that hands back a fresh `FakeHub`, or omit it
/// entirely to opt out of automatic reconnection.
pub type ReconnectFactory = Arc<dyn Fn() -> GatewayResult<Arc<dyn HubClient>> + Send + Sync>;

const ALL_CONNECTION_TYPES: [ConnectionType; 5] = [
    ConnectionType::Publisher,
    ConnectionType::Subscriber,
    ConnectionType::Service,
    ConnectionType::ActionClient,
    ConnectionType::ActionServer,
];

/// A snapshot of this gateway's local state, for the `gateway_info` command.
#[derive(Debug, Clone)]
pub struct GatewayInfo {
    pub name: String,
    pub firewall: bool,
    pub public_interface: Vec<Connection>,
    pub flip_rule_count: usize,
    pub pull_rule_count: usize,
}

struct ConnectedHub {
    client: Arc<dyn HubClient>,
    checker: HubConnectionChecker,
    /// Kept alive only so dropping it stops its thread; the engine never
    /// reads notifications off of this directly (see `drain`).
    _pubsub: Option<PubsubListener>,
    /// Logs wake-up notifications as they arrive. Ends on its own once
    /// `_pubsub` is dropped and its channel disconnects.
    drain: Option<std::thread::JoinHandle<()>>,
}

/// Owns everything the watcher reads and everything operator commands
/// mutate. `name` is this gateway's requested identity; the hub may append
/// a suffix to keep it unique (`unique_name()` on the returned hub client
/// reports what was actually assigned).
pub struct GatewayEngine {
    name: String,
    firewall: bool,
    config: GatewayConfig,
    adapter: Arc<dyn LocalAdapter>,
    rules: Arc<Mutex<RuleStore>>,
    hubs: Arc<Mutex<Vec<Arc<dyn HubClient>>>>,
    connected: Arc<Mutex<HashMap<(String, u16), ConnectedHub>>>,
    state: Arc<Mutex<WatcherState>>,
    watcher: Mutex<Option<Watcher>>,
    /// Set during `shutdown()` so any in-flight reconnect-with-backoff loop
    /// bails out instead of reconnecting a hub the engine is tearing down.
    shutting_down: Arc<AtomicBool>,
}

impl GatewayEngine {
    pub fn new(name: impl Into<String>, firewall: bool, config: GatewayConfig, adapter: Arc<dyn LocalAdapter>) -> Self {
        GatewayEngine {
            name: name.into(),
            firewall,
            config,
            adapter,
            rules: Arc::new(Mutex::new(RuleStore::new())),
            hubs: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(WatcherState::new())),
            watcher: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the watcher thread. Call once, after at least one hub is
    /// connected (the watcher tolerates an empty hub list, it just has
    /// nothing to reconcile against).
    pub fn start_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap();
        if watcher.is_some() {
            return;
        }
        *watcher = Some(Watcher::spawn(
            self.config.watch_interval,
            self.config.flip_key_poll_timeout,
            self.config.registration_retry_limit,
            Arc::clone(&self.state),
            Arc::clone(&self.rules),
            Arc::clone(&self.hubs),
            Arc::clone(&self.adapter),
        ));
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }
        let mut connected = self.connected.lock().unwrap();
        for (_, mut hub) in connected.drain() {
            hub.checker.stop();
            hub._pubsub = None;
            if let Some(drain) = hub.drain.take() {
                let _ = drain.join();
            }
            let _ = hub.client.unregister_gateway();
        }
        self.hubs.lock().unwrap().clear();
    }

    /// `connect_hub(ip, port)`: register this gateway on an already-built hub
    /// client and start its connection checker, with no automatic
    /// reconnection on loss. Production code normally wants
    /// [`GatewayEngine::connect_hub_with_reconnect`] instead; this is for
    /// tests and one-shot/manual connections.
    pub fn connect_hub(&self, hub: Arc<dyn HubClient>) -> GatewayResult<String> {
        self.connect_hub_with_reconnect(hub, None)
    }

    /// Same as `connect_hub`, but on loss spawns a background thread that
    /// retries `reconnect_factory` with exponential backoff
    /// (`reconnect_backoff_initial` doubling up to `reconnect_backoff_max`)
    /// until it succeeds or the engine shuts down. A successful reconnect
    /// re-registers under a fresh keypair (prior `unique_name` is not
    /// guaranteed reclaimable, §4.9) and re-wires the checker, pub/sub
    /// listener and drain thread exactly as the original `connect_hub` did.
    pub fn connect_hub_with_reconnect(
        &self,
        hub: Arc<dyn HubClient>,
        reconnect_factory: Option<ReconnectFactory>,
    ) -> GatewayResult<String> {
        wire_hub(
            hub,
            &self.name,
            self.firewall,
            &self.config,
            &self.hubs,
            &self.connected,
            &self.shutting_down,
            reconnect_factory,
        )
    }

    pub fn disconnect_hub(&self, ip: &str, port: u16) {
        if let Some(mut hub) = self.connected.lock().unwrap().remove(&(ip.to_string(), port)) {
            hub.checker.stop();
            hub._pubsub = None;
            if let Some(drain) = hub.drain.take() {
                let _ = drain.join();
            }
            let _ = hub.client.unregister_gateway();
        }
        self.hubs.lock().unwrap().retain(|h| h.ip() != ip || h.port() != port);
    }

    pub fn advertise(&self, rules: Vec<Rule>) {
        let mut store = self.rules.lock().unwrap();
        for rule in rules {
            if !store.public.whitelist.contains(&rule) {
                store.public.whitelist.push(rule);
            }
        }
    }

    pub fn unadvertise(&self, rules: &[Rule]) {
        let mut store = self.rules.lock().unwrap();
        store.public.whitelist.retain(|r| !rules.contains(r));
    }

    pub fn flip(&self, remote_rules: Vec<RemoteRule>) {
        let mut store = self.rules.lock().unwrap();
        for rule in remote_rules {
            if !store.flip.contains(&rule) {
                store.flip.push(rule);
            }
        }
    }

    pub fn unflip(&self, remote_rules: &[RemoteRule]) {
        let mut store = self.rules.lock().unwrap();
        store.flip.retain(|r| !remote_rules.contains(r));
    }

    pub fn pull(&self, remote_rules: Vec<RemoteRule>) {
        let mut store = self.rules.lock().unwrap();
        for rule in remote_rules {
            if !store.pull.contains(&rule) {
                store.pull.push(rule);
            }
        }
    }

    pub fn unpull(&self, remote_rules: &[RemoteRule]) {
        let mut store = self.rules.lock().unwrap();
        store.pull.retain(|r| !remote_rules.contains(r));
    }

    /// Flips every live local endpoint (of any type) to each named target.
    /// Candidates are still filtered to public-ruleset-eligible connections
    /// at reconcile time -- this and `flip_all_public` are
    /// therefore equivalent; see DESIGN.md for the resolved open question.
    pub fn flip_all(&self, targets: &[String]) -> GatewayResult<()> {
        self.flip_all_public(targets)
    }

    pub fn flip_all_public(&self, targets: &[String]) -> GatewayResult<()> {
        let mut store = self.rules.lock().unwrap();
        for target in targets {
            for kind in ALL_CONNECTION_TYPES {
                let rule = RemoteRule::new(target, Rule::new(kind, ".*", ".*")?)?;
                if !store.flip.contains(&rule) {
                    store.flip.push(rule);
                }
            }
        }
        Ok(())
    }

    /// Flips only the endpoints that are public *right now*, as an exact
    /// one-shot snapshot rather than an ongoing wildcard rule: a later
    /// newly-public endpoint is not picked up automatically.
    pub fn flip_list_only(&self, targets: &[String]) -> GatewayResult<()> {
        let advertised: Vec<Connection> = self.state.lock().unwrap().public.advertised().iter().cloned().collect();
        let mut store = self.rules.lock().unwrap();
        for target in targets {
            for connection in &advertised {
                let rule = RemoteRule::new(target, Rule::new(connection.kind, &regex::escape(&connection.name), ".*")?)?;
                if !store.flip.contains(&rule) {
                    store.flip.push(rule);
                }
            }
        }
        Ok(())
    }

    pub fn make_all_public(&self) {
        let mut store = self.rules.lock().unwrap();
        for kind in ALL_CONNECTION_TYPES {
            store.public.make_all_public(kind);
        }
    }

    pub fn remove_all_public(&self) {
        let mut store = self.rules.lock().unwrap();
        for kind in ALL_CONNECTION_TYPES {
            store.public.remove_all_public(kind);
        }
    }

    pub fn gateway_info(&self) -> GatewayInfo {
        let state = self.state.lock().unwrap();
        let rules = self.rules.lock().unwrap();
        GatewayInfo {
            name: self.name.clone(),
            firewall: self.firewall,
            public_interface: state.public.advertised().iter().cloned().collect(),
            flip_rule_count: rules.flip.len(),
            pull_rule_count: rules.pull.len(),
        }
    }

    pub fn remote_gateway_info(&self, names: &[String]) -> HashMap<String, GatewayDirectoryEntry> {
        let hubs = self.hubs.lock().unwrap();
        let mut out = HashMap::new();
        for name in names {
            for hub in hubs.iter() {
                if let Ok(Some(entry)) = hub.remote_gateway_info(name) {
                    out.insert(name.clone(), entry);
                    break;
                }
            }
        }
        out
    }
}

/// Registers `hub`, starts its connection checker and pub/sub listener, and
/// records it in `hubs`/`connected`. On loss, if `reconnect_factory` is
/// given, spawns a background thread that retries it with exponential
/// backoff and re-wires the result the same way -- `on_connection_lost`'s
/// step 3-4 from §4.9, made concrete without requiring the engine itself to
/// be `Arc`-wrapped.
#[allow(clippy::too_many_arguments)]
fn wire_hub(
    hub: Arc<dyn HubClient>,
    name: &str,
    firewall: bool,
    config: &GatewayConfig,
    hubs: &Arc<Mutex<Vec<Arc<dyn HubClient>>>>,
    connected: &Arc<Mutex<HashMap<(String, u16), ConnectedHub>>>,
    shutting_down: &Arc<AtomicBool>,
    reconnect_factory: Option<ReconnectFactory>,
) -> GatewayResult<String> {
    let key = (hub.ip().to_string(), hub.port());
    let unique_name = hub.register_gateway(firewall, name, hub.ip())?;

    let hubs_for_loss = Arc::clone(hubs);
    let connected_for_loss = Arc::clone(connected);
    let lost_key = key.clone();
    let hub_for_loss = Arc::clone(&hub);
    let name_for_loss = name.to_string();
    let config_for_loss = config.clone();
    let shutting_down_for_loss = Arc::clone(shutting_down);
    let hubs_for_reconnect = Arc::clone(hubs);

    let on_connection_lost = move || {
        log::error!("lost connection to hub {}:{}", lost_key.0, lost_key.1);
        hubs_for_loss.lock().unwrap().retain(|h| !Arc::ptr_eq(h, &hub_for_loss));

        // The checker thread can't join itself, so the owning entry (and its
        // `HubConnectionChecker`) is dropped from a separate thread rather
        // than inline here. The optional reconnect runs sequentially after
        // the removal on that same thread, never a second detached one, so a
        // slow removal can never race a fresh insert under the same key.
        let connected = Arc::clone(&connected_for_loss);
        let key = lost_key.clone();
        let name = name_for_loss.clone();
        let config = config_for_loss.clone();
        let shutting_down = Arc::clone(&shutting_down_for_loss);
        let hubs = Arc::clone(&hubs_for_reconnect);
        let reconnect_factory = reconnect_factory.clone();
        std::thread::spawn(move || {
            connected.lock().unwrap().remove(&key);

            let Some(factory) = reconnect_factory else { return };
            let reconnected = reconnect_with_backoff(
                || factory(),
                config.reconnect_backoff_initial,
                config.reconnect_backoff_max,
                shutting_down.as_ref(),
            );
            if shutting_down.load(Ordering::Relaxed) {
                return;
            }
            match reconnected {
                Ok(new_hub) => {
                    if let Err(e) = wire_hub(new_hub, &name, firewall, &config, &hubs, &connected, &shutting_down, Some(factory)) {
                        log::error!("reconnected to hub but re-registration failed: {e}");
                    }
                }
                Err(e) => log::error!("giving up reconnecting to hub: {e}"),
            }
        });
    };

    let checker = HubConnectionChecker::spawn(Arc::clone(&hub), config.ping_interval, config.checker_failure_threshold, on_connection_lost);

    // Personal-channel notifications are a latency optimization only --
    // there is no point-to-point ACK; the watcher's next tick would reach
    // the same state regardless, so a dropped notification or an
    // unsupported hub (e.g. a test double) is never fatal.
    let (tx, rx) = pubsub::command_channel(16);
    let pubsub_listener = hub.subscribe_personal_channel(tx);
    let drain = std::thread::spawn(move || {
        while let Ok(command) = rx.recv() {
            let connection = pubsub::describes_connection(&command);
            log::debug!("hub notification {command:?} for {}", connection.name);
        }
    });

    hubs.lock().unwrap().push(Arc::clone(&hub));
    connected.lock().unwrap().insert(
        key,
        ConnectedHub {
            client: hub,
            checker,
            _pubsub: pubsub_listener,
            drain: Some(drain),
        },
    );

    Ok(unique_name)
}

/// Reconnects `factory` with exponential backoff (`initial` doubling up to
/// `max`) until it succeeds or `stop` is set; returns the reconnected hub's
/// engine key so the caller can `connect_hub` it. Runs on the caller's
/// thread -- callers that want this backgrounded should spawn it themselves.
pub fn reconnect_with_backoff<F>(
    mut factory: F,
    initial: Duration,
    max: Duration,
    stop: &std::sync::atomic::AtomicBool,
) -> GatewayResult<Arc<dyn HubClient>>
where
    F: FnMut() -> GatewayResult<Arc<dyn HubClient>>,
{
    let mut backoff = initial;
    loop {
        match factory() {
            Ok(hub) => return Ok(hub),
            Err(e) => {
                if stop.load(std::sync::atomic::Ordering::Relaxed) {
                    return Err(e);
                }
                std::thread::sleep(backoff);
                backoff = std::cmp::min(backoff * 2, max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapter;
    use crate::hub::client::fake::FakeHub;

    #[test]
    fn advertise_is_idempotent() {
        let adapter = Arc::new(FakeAdapter::new());
        let engine = GatewayEngine::new("G1", false, GatewayConfig::default(), adapter);
        let rule = Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap();
        engine.advertise(vec![rule.clone()]);
        engine.advertise(vec![rule]);
        assert_eq!(engine.rules.lock().unwrap().public.whitelist.len(), 1);
    }

    #[test]
    fn connect_hub_registers_and_tracks_unique_name() {
        let adapter = Arc::new(FakeAdapter::new());
        let engine = GatewayEngine::new("G1", false, GatewayConfig::default(), adapter);
        let hub = Arc::new(FakeHub::new("10.0.0.1", 6379));
        let name = engine.connect_hub(hub).unwrap();
        assert_eq!(name, "G1");
        assert_eq!(engine.hubs.lock().unwrap().len(), 1);
    }

    #[test]
    fn disconnect_hub_unregisters_and_removes_checker() {
        let adapter = Arc::new(FakeAdapter::new());
        let engine = GatewayEngine::new("G1", false, GatewayConfig::default(), adapter);
        let hub = Arc::new(FakeHub::new("10.0.0.1", 6379));
        engine.connect_hub(hub).unwrap();
        engine.disconnect_hub("10.0.0.1", 6379);
        assert!(engine.hubs.lock().unwrap().is_empty());
    }

    #[test]
    fn lost_hub_is_automatically_reconnected_with_a_fresh_registration() {
        let adapter = Arc::new(FakeAdapter::new());
        let mut config = GatewayConfig::default();
        config.ping_interval = Duration::from_millis(10);
        config.checker_failure_threshold = 2;
        config.reconnect_backoff_initial = Duration::from_millis(10);
        config.reconnect_backoff_max = Duration::from_millis(20);
        let engine = GatewayEngine::new("G1", false, config, adapter);

        let dying = Arc::new(FakeHub::new("10.0.0.1", 6379));
        dying.set_healthy(false);

        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_for_factory = Arc::clone(&attempts);
        let factory: ReconnectFactory = Arc::new(move || {
            let n = attempts_for_factory.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                // First reconnect attempt still fails, exercising the
                // backoff loop, not just a single retry.
                return Err(crate::error::GatewayError::HubConnectionLost);
            }
            let fresh = Arc::new(FakeHub::new("10.0.0.1", 6379));
            Ok(fresh as Arc<dyn HubClient>)
        });

        engine.connect_hub_with_reconnect(dying, Some(factory)).unwrap();
        assert_eq!(engine.hubs.lock().unwrap().len(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if engine.connected.lock().unwrap().len() == 1 && attempts.load(Ordering::Relaxed) >= 2 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "hub was never reconnected");
            std::thread::sleep(Duration::from_millis(20));
        }

        engine.shutdown();
    }

    #[test]
    fn make_all_public_then_remove_reverts() {
        let adapter = Arc::new(FakeAdapter::new());
        let engine = GatewayEngine::new("G1", false, GatewayConfig::default(), adapter);
        engine.make_all_public();
        assert!(!engine.rules.lock().unwrap().public.whitelist.is_empty());
        engine.remove_all_public();
        assert!(engine.rules.lock().unwrap().public.whitelist.is_empty());
    }
}
