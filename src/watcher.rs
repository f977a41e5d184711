//! The watcher loop: the single reconciliation thread.
//! Level-triggered — every tick recomputes the desired set from rules plus
//! observed live state and issues only the diff. No edge event is ever
//! required for correctness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::LocalAdapter;
use crate::hub::schema::{LatencyStats, NetworkStatistics};
use crate::hub::HubClient;
use crate::interfaces::{FlippedInterface, PublicInterface, PulledInterface};
use crate::rule_store::RuleStore;

/// Shared, single-writer committed state the watcher owns across ticks.
/// Guarded by one mutex so `gateway_info`-style commands can take a short
/// read lock without racing a tick in progress.
pub struct WatcherState {
    pub public: PublicInterface,
    pub flipped: FlippedInterface,
    pub pulled: PulledInterface,
}

impl WatcherState {
    pub fn new() -> Self {
        WatcherState {
            public: PublicInterface::new(),
            flipped: FlippedInterface::new(),
            pulled: PulledInterface::new(),
        }
    }
}

impl Default for WatcherState {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the six-step tick in order on a dedicated thread until stopped.
pub struct Watcher {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        watch_interval: Duration,
        flip_timeout: Duration,
        registration_retry_limit: u32,
        state: Arc<Mutex<WatcherState>>,
        rules: Arc<Mutex<RuleStore>>,
        hubs: Arc<Mutex<Vec<Arc<dyn HubClient>>>>,
        adapter: Arc<dyn LocalAdapter>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            while !stop_for_thread.load(Ordering::Relaxed) {
                tick(&state, &rules, &hubs, adapter.as_ref(), flip_timeout, registration_retry_limit);
                std::thread::sleep(watch_interval);
            }
        });

        Watcher {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One reconciliation tick, steps in a fixed order.
fn tick(
    state: &Arc<Mutex<WatcherState>>,
    rules: &Arc<Mutex<RuleStore>>,
    hubs: &Arc<Mutex<Vec<Arc<dyn HubClient>>>>,
    adapter: &dyn LocalAdapter,
    flip_timeout: Duration,
    registration_retry_limit: u32,
) {
    // 1. Refresh local adapter snapshot.
    let live = adapter.get_connection_state();

    let hubs_snapshot = hubs.lock().unwrap().clone();
    let rules_snapshot = rules.lock().unwrap().clone();
    let mut state = state.lock().unwrap();

    // 2. Reconcile public interface.
    state.public.reconcile(&rules_snapshot.public, &live, &hubs_snapshot);

    // 3. Refresh remote directory list happens implicitly inside each
    // reconcile call below via `list_remote_gateway_names`/`matches_*`.

    // 4. Reconcile flipped (outbound).
    state
        .flipped
        .reconcile_outbound(&rules_snapshot.flip, &rules_snapshot.public, &live, &hubs_snapshot, flip_timeout);

    // 5. Inbound offers + accept policy, then pulled interface.
    state.flipped.reconcile_inbound(&rules_snapshot, &hubs_snapshot, adapter, registration_retry_limit);
    let accepted_inbound_sources = state.flipped.accepted_inbound_sources();
    state
        .pulled
        .reconcile(&rules_snapshot.pull, &hubs_snapshot, adapter, registration_retry_limit, &accepted_inbound_sources);

    // 6. Publish network statistics and refresh :ping TTL.
    for hub in &hubs_snapshot {
        let _ = hub.publish_network_statistics(&NetworkStatistics::default(), &LatencyStats::default());
        let _ = hub.refresh_ping();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapter;
    use crate::connection::{Connection, ConnectionType, RemoteRule, Rule};
    use crate::hub::client::fake::FakeHub;

    #[test]
    fn a_single_tick_advertises_and_pulls_across_two_gateways() {
        let hub = Arc::new(FakeHub::new("10.0.0.1", 6379));
        hub.register_gateway(false, "G1", "10.0.0.2").unwrap();

        let adapter = Arc::new(FakeAdapter::new());
        adapter.set_live(
            ConnectionType::Publisher,
            vec![Connection::new(ConnectionType::Publisher, "/chatter", "/g1/talker", "std_msgs/String", "tcp://h:1")],
        );

        let mut rules = RuleStore::new();
        rules.public.whitelist.push(Rule::new(ConnectionType::Publisher, "/chatter", ".*").unwrap());
        let rules = Arc::new(Mutex::new(rules));

        let hubs: Arc<Mutex<Vec<Arc<dyn HubClient>>>> = Arc::new(Mutex::new(vec![hub.clone()]));
        let state = Arc::new(Mutex::new(WatcherState::new()));

        tick(&state, &rules, &hubs, adapter.as_ref(), Duration::from_millis(50), 5);

        let remote = hub.remote_gateway_info("G1").unwrap().unwrap();
        assert_eq!(remote.public_interface.len(), 1);
    }
}
