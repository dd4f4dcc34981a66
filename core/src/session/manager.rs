//! Session table and turn admission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::config::EngineConfig;
use crate::context::{HistoryStore, MemoryFusion};
use crate::orchestrator::{self, TurnContext, TurnSettings};
use crate::session::types::{
    now_ms, ActiveTurn, Session, SessionSnapshot, Turn, TurnHandle, TurnInput,
};
use crate::telemetry::EngineMetrics;
use crate::{EngineError, Result};

/// One session's slot in the table. `owner_id` is immutable and readable
/// without the entry lock; everything else lives in `state`.
pub(crate) struct SessionEntry {
    pub(crate) owner_id: String,
    pub(crate) state: Mutex<Session>,
}

/// Decrements the global in-flight backend counter exactly once, when the
/// turn reaches a terminal state and the orchestrator drops it.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Result<Self> {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Err(EngineError::BackendSaturated(limit));
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Self {
                        counter: Arc::clone(counter),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns the set of live sessions and routes inbound turns to the
/// orchestrator.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionEntry>>,
    owner_counts: DashMap<String, usize>,
    registry: Arc<BackendRegistry>,
    fusion: Arc<MemoryFusion>,
    history: Arc<dyn HistoryStore>,
    config: EngineConfig,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<EngineMetrics>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        registry: Arc<BackendRegistry>,
        fusion: Arc<MemoryFusion>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            owner_counts: DashMap::new(),
            registry,
            fusion,
            history,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics,
        })
    }

    /// Create a session for `owner_id`.
    ///
    /// Fails with `QuotaExceeded` once the owner holds the configured number
    /// of concurrent sessions.
    pub async fn open_session(&self, owner_id: &str, title: Option<String>) -> Result<String> {
        {
            // Entry access is the atomic check-and-increment for the quota.
            let mut count = self.owner_counts.entry(owner_id.to_string()).or_insert(0);
            if *count >= self.config.max_sessions_per_owner {
                return Err(EngineError::QuotaExceeded {
                    owner: owner_id.to_string(),
                    limit: self.config.max_sessions_per_owner,
                });
            }
            *count += 1;
        }

        let session = Session::new(
            owner_id,
            title,
            self.config.default_model.clone(),
            self.config.default_history_window,
        );
        let session_id = session.id.clone();

        self.sessions.insert(
            session_id.clone(),
            Arc::new(SessionEntry {
                owner_id: owner_id.to_string(),
                state: Mutex::new(session),
            }),
        );
        self.metrics.record_session_opened().await;

        info!(session = %session_id, owner = %owner_id, "Opened session");
        Ok(session_id)
    }

    /// Submit a user message as a new turn.
    ///
    /// The turn is installed as the session's `active_turn` under the entry
    /// lock before the orchestrator task starts: the check-and-set is atomic
    /// and a second submission observes `SessionBusy`, never a queue.
    pub async fn submit_turn(
        self: &Arc<Self>,
        session_id: &str,
        input: TurnInput,
    ) -> Result<TurnHandle> {
        let entry = self.entry(session_id)?;
        let mut session = entry.state.lock().await;

        // The session may have been closed or evicted while waiting on the
        // entry lock.
        if !self.sessions.contains_key(session_id) {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }

        let now = now_ms();
        let idle = now.saturating_sub(session.last_active_at);
        if self.config.idle_timeout_ms > 0 && idle > self.config.idle_timeout_ms as i64 {
            return Err(EngineError::SessionExpired(session_id.to_string()));
        }

        if session.active_turn.is_some() {
            return Err(EngineError::SessionBusy(session_id.to_string()));
        }

        // Unknown models fail here, at submission, never mid-stream.
        let backend = self.registry.resolve(&session.model_selector)?;

        // Admission control: fail fast past the global backend cap.
        let in_flight = InFlightGuard::acquire(
            &self.in_flight,
            self.config.max_concurrent_backend_calls,
        )?;

        let turn = Turn::new(session_id, input);
        let turn_id = turn.turn_id.clone();
        let turn = Arc::new(Mutex::new(turn));
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);

        session.active_turn = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            turn: Arc::clone(&turn),
            cancel: cancel.clone(),
        });
        session.last_active_at = now;
        let history_window = session.history_window;
        let model = session.model_selector.clone();
        drop(session);

        self.metrics.record_turn_started().await;
        debug!(session = %session_id, turn = %turn_id, model = %model, "Turn admitted");

        let ctx = TurnContext {
            session_id: session_id.to_string(),
            entry: Arc::clone(&entry),
            turn: Arc::clone(&turn),
            backend,
            fusion: Arc::clone(&self.fusion),
            history: Arc::clone(&self.history),
            events: events_tx,
            cancel: cancel.clone(),
            history_window,
            settings: TurnSettings {
                adapter_timeout: Duration::from_millis(self.config.adapter_timeout_ms),
                keep_partial_transcripts: self.config.keep_partial_transcripts,
                system_prompt: self.config.system_prompt.clone(),
                strip_prompt_echo: self.config.strip_prompt_echo,
                params: crate::backend::GenerationParams {
                    max_output_tokens: self.config.max_output_tokens,
                    temperature: self.config.temperature,
                },
                adapter_channel_capacity: self.config.event_channel_capacity,
            },
            metrics: Arc::clone(&self.metrics),
            in_flight,
        };
        tokio::spawn(orchestrator::run_turn(ctx));

        Ok(TurnHandle::new(
            turn_id,
            session_id.to_string(),
            events_rx,
            cancel,
            turn,
        ))
    }

    /// Cancel the session's active turn, if any. Returns whether a turn was
    /// signalled.
    pub async fn cancel_turn(&self, session_id: &str) -> Result<bool> {
        let entry = self.entry(session_id)?;
        let session = entry.state.lock().await;
        if let Some(active) = &session.active_turn {
            info!(session = %session_id, turn = %active.turn_id, "Cancelling active turn");
            active.cancel.cancel();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Cancel any active turn and remove the session.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let session = entry.state.lock().await;
        if let Some(active) = &session.active_turn {
            active.cancel.cancel();
        }
        drop(session);

        self.release_owner_slot(&entry.owner_id);
        self.metrics.record_session_closed(false).await;
        info!(session = %session_id, "Closed session");
        Ok(())
    }

    /// Close every session (engine shutdown).
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close_session(&id).await;
        }
    }

    /// Sweep sessions idle past the threshold with no active turn.
    pub async fn evict_idle(&self) -> usize {
        if self.config.idle_timeout_ms == 0 {
            return 0;
        }
        let now = now_ms();
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut evicted = 0;

        for id in ids {
            let Some(entry) = self.sessions.get(&id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let session = entry.state.lock().await;
            let idle = now.saturating_sub(session.last_active_at);
            if session.active_turn.is_none() && idle > self.config.idle_timeout_ms as i64 {
                // Remove while holding the entry lock so a concurrent submit
                // cannot install a turn on the evicted session.
                self.sessions.remove(&id);
                drop(session);
                self.release_owner_slot(&entry.owner_id);
                self.metrics.record_session_closed(true).await;
                info!(session = %id, "Evicted idle session");
                evicted += 1;
            }
        }
        evicted
    }

    /// Spawn the periodic eviction sweep.
    pub fn spawn_eviction_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_millis(manager.config.eviction_interval_ms.max(100));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    debug!(evicted, "Eviction sweep finished");
                }
            }
        })
    }

    /// Switch the session's model for subsequent turns. An in-flight turn
    /// always finishes on the adapter it started with.
    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        if !self.registry.contains(model_id) {
            return Err(EngineError::UnsupportedModel(model_id.to_string()));
        }
        let entry = self.entry(session_id)?;
        let mut session = entry.state.lock().await;
        info!(session = %session_id, from = %session.model_selector, to = %model_id, "Model switched");
        session.model_selector = model_id.to_string();
        Ok(())
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let entry = self.entry(session_id)?;
        let session = entry.state.lock().await;
        Ok(SessionSnapshot::of(&session))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Outstanding backend calls.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn release_owner_slot(&self, owner_id: &str) {
        if let Some(mut count) = self.owner_counts.get_mut(owner_id) {
            *count = count.saturating_sub(1);
        } else {
            warn!(owner = %owner_id, "Owner count missing on session release");
        }
    }
}
