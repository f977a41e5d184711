//! Dedicated hub-health thread: periodic ping, RTT stats, and the
//! application-level health check. Fires `on_connection_lost`
//! exactly once per actual loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::hub::client::HubClient;
use crate::hub::schema::{LatencyStats, NetworkStatistics};

/// Runs `ping_interval`-spaced health checks against one hub until stopped,
/// calling `on_connection_lost` the first time the hub stops answering.
pub struct HubConnectionChecker {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HubConnectionChecker {
    pub fn spawn(
        hub: Arc<dyn HubClient>,
        ping_interval: Duration,
        failure_threshold: u32,
        on_connection_lost: impl Fn() + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let mut consecutive_failures = 0u32;
            let mut reported_lost = false;
            let mut samples: Vec<f64> = Vec::new();

            while !stop_for_thread.load(Ordering::Relaxed) {
                let started = Instant::now();
                let healthy = hub.application_health_check().is_ok();
                let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

                if healthy {
                    consecutive_failures = 0;
                    reported_lost = false;
                    samples.push(rtt_ms);
                    if samples.len() > 20 {
                        samples.remove(0);
                    }
                    let stats = latency_stats(&samples);
                    let _ = hub.publish_network_statistics(&NetworkStatistics::default(), &stats);
                    let _ = hub.refresh_ping();
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= failure_threshold && !reported_lost {
                        reported_lost = true;
                        on_connection_lost();
                    }
                }

                std::thread::sleep(ping_interval);
            }
        });

        HubConnectionChecker {
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

impl Drop for HubConnectionChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn latency_stats(samples: &[f64]) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / samples.len() as f64;
    LatencyStats {
        min,
        avg,
        max,
        mdev: variance.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_stats_of_a_single_sample_has_zero_deviation() {
        let stats = latency_stats(&[12.0]);
        assert_eq!(stats.min, 12.0);
        assert_eq!(stats.max, 12.0);
        assert_eq!(stats.avg, 12.0);
        assert_eq!(stats.mdev, 0.0);
    }

    #[test]
    fn latency_stats_of_no_samples_is_zeroed() {
        let stats = latency_stats(&[]);
        assert_eq!(stats.avg, 0.0);
    }
}
