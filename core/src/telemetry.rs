// Telemetry: tracing setup and engine-level counters
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use crate::session::TurnStatus;

/// Initialize the tracing subscriber (env-filtered fmt output).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

/// Engine-level counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub turns_cancelled: u64,
    pub avg_turn_latency_ms: f64,
    pub p99_turn_latency_ms: f64,
    pub turns_per_second: f64,
}

/// Collector for engine statistics
pub struct EngineMetrics {
    stats: Arc<RwLock<EngineStats>>,
    latencies: Arc<RwLock<Vec<Duration>>>,
    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(EngineStats::default())),
            latencies: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
        }
    }

    pub async fn record_session_opened(&self) {
        self.stats.write().await.sessions_opened += 1;
    }

    pub async fn record_session_closed(&self, evicted: bool) {
        let mut stats = self.stats.write().await;
        stats.sessions_closed += 1;
        if evicted {
            stats.sessions_evicted += 1;
        }
    }

    pub async fn record_turn_started(&self) {
        self.stats.write().await.turns_started += 1;
    }

    /// Record a terminal turn with its wall-clock latency.
    pub async fn record_turn_finished(&self, status: TurnStatus, latency: Duration) {
        let mut stats = self.stats.write().await;
        match status {
            TurnStatus::Completed => stats.turns_completed += 1,
            TurnStatus::Failed => stats.turns_failed += 1,
            TurnStatus::Cancelled => stats.turns_cancelled += 1,
            // Non-terminal states are never recorded here.
            TurnStatus::Pending | TurnStatus::Streaming => return,
        }

        let mut latencies = self.latencies.write().await;
        latencies.push(latency);

        let total_ms: f64 = latencies.iter().map(|d| d.as_millis() as f64).sum();
        stats.avg_turn_latency_ms = total_ms / latencies.len() as f64;

        let mut sorted = latencies.clone();
        sorted.sort();
        let p99_idx = (sorted.len() as f64 * 0.99) as usize;
        if p99_idx < sorted.len() {
            stats.p99_turn_latency_ms = sorted[p99_idx].as_millis() as f64;
        }

        let terminal = stats.turns_completed + stats.turns_failed + stats.turns_cancelled;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            stats.turns_per_second = terminal as f64 / elapsed;
        }
    }

    pub async fn get_stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Print stats to log
    pub async fn print_stats(&self) {
        let stats = self.get_stats().await;
        info!("=== Engine Stats ===");
        info!(
            "Sessions: opened={} closed={} evicted={}",
            stats.sessions_opened, stats.sessions_closed, stats.sessions_evicted
        );
        info!(
            "Turns: started={} completed={} failed={} cancelled={}",
            stats.turns_started, stats.turns_completed, stats.turns_failed, stats.turns_cancelled
        );
        info!("Avg Turn Latency: {:.2}ms", stats.avg_turn_latency_ms);
        info!("P99 Turn Latency: {:.2}ms", stats.p99_turn_latency_ms);
        info!("Turns/sec: {:.2}", stats.turns_per_second);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
