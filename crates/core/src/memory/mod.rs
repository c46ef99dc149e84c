//! Process-wide memory accounting.
//!
//! The manager keeps a rolling window of usage samples, compares each new
//! sample against a soft and a hard threshold, and runs registered cleanup
//! callbacks when usage climbs past the soft one. Components that are about
//! to buffer something large call [`MemoryManager::check_limit`] first.
//!
//! Nothing here ever terminates the process; the worst outcome is a refused
//! allocation (`MemoryLimitExceeded`) and a warning.

mod probe;
mod sample;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use probe::{ManualProbe, ProcessProbe, UsageProbe};
pub use sample::MemorySample;

use crate::Error;
use crate::workers::WorkerPool;
use sample::SampleWindow;

/// Thresholds and window sizing.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
    /// Samples kept for trend and leak detection.
    pub window_size: usize,
    /// Consecutive checkpoints above the soft limit required before a growing
    /// window is reported as a suspected leak.
    pub leak_consecutive: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { soft_limit_bytes: 768 * 1024 * 1024, hard_limit_bytes: 1024 * 1024 * 1024, window_size: 32, leak_consecutive: 8 }
    }
}

/// Result of a successful [`MemoryManager::check_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    /// Above the soft threshold; the allocation may proceed.
    Elevated,
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    SoftLimitCrossed { usage_bytes: u64, limit_bytes: u64 },
    HardLimitExceeded { usage_bytes: u64, limit_bytes: u64 },
    LeakSuspected { usage_bytes: u64, trend_bytes_per_sec: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MemoryStats {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
    pub trend_bytes_per_sec: f64,
    pub window_len: usize,
    pub checkpoints: u64,
    pub warnings: u64,
    pub hard_limit_hits: u64,
    pub cleanup_callbacks: usize,
    pub cleanup_runs: u64,
    pub cleanup_failures: u64,
    pub leak_suspected: bool,
}

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;
type CleanupFn = Arc<dyn Fn() -> CleanupFuture + Send + Sync>;

#[derive(Debug)]
struct WindowState {
    window: SampleWindow,
    peak: u64,
    above_soft: bool,
    above_soft_streak: usize,
    leak_suspected: bool,
}

#[derive(Debug, Default)]
struct CleanupState {
    running: AtomicBool,
    runs: AtomicU64,
    failures: AtomicU64,
}

/// Clears the running flag when the cleanup task finishes or is dropped unstarted.
struct RunningGuard(Arc<CleanupState>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Tracks usage against soft/hard thresholds and runs cleanup callbacks.
pub struct MemoryManager {
    config: MemoryConfig,
    probe: Arc<dyn UsageProbe>,
    pool: Arc<WorkerPool>,
    state: Mutex<WindowState>,
    callbacks: RwLock<Vec<(String, CleanupFn)>>,
    cleanup: Arc<CleanupState>,
    events: broadcast::Sender<MemoryEvent>,
    checkpoints: AtomicU64,
    warnings: AtomicU64,
    hard_limit_hits: AtomicU64,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig, probe: Arc<dyn UsageProbe>, pool: Arc<WorkerPool>) -> Self {
        let state = WindowState {
            window: SampleWindow::new(config.window_size),
            peak: 0,
            above_soft: false,
            above_soft_streak: 0,
            leak_suspected: false,
        };
        let (events, _) = broadcast::channel(64);

        Self {
            config,
            probe,
            pool,
            state: Mutex::new(state),
            callbacks: RwLock::new(Vec::new()),
            cleanup: Arc::new(CleanupState::default()),
            events,
            checkpoints: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            hard_limit_hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Register a callback that frees memory.
    ///
    /// Callbacks run in registration order on a worker-pool task whenever usage
    /// crosses the soft threshold or a hard-limit check fails. A failing or
    /// panicking callback is logged and does not stop the ones after it.
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let callback: CleanupFn = Arc::new(move || Box::pin(callback()) as CleanupFuture);
        let name = name.into();
        tracing::debug!(callback = %name, "registered memory cleanup callback");
        self.callbacks.write().unwrap_or_else(|e| e.into_inner()).push((name, callback));
    }

    /// Sample current usage, append it to the window and evaluate thresholds.
    ///
    /// Concurrent checkpoints are serialized; sample timestamps are monotonic.
    pub fn checkpoint(&self) -> Result<MemorySample, Error> {
        let usage = self.probe.current_usage()?;
        Ok(self.record(usage))
    }

    fn record(&self, usage: u64) -> MemorySample {
        let soft = self.config.soft_limit_bytes;
        let hard = self.config.hard_limit_bytes;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let sample = state.window.push(Utc::now(), usage);
        state.peak = state.peak.max(usage);

        let above_soft = usage > soft;
        let crossed_soft = above_soft && !state.above_soft;
        state.above_soft = above_soft;
        state.above_soft_streak = if above_soft { state.above_soft_streak + 1 } else { 0 };

        let leak = state.window.is_non_decreasing() && state.above_soft_streak >= self.config.leak_consecutive;
        let newly_leaking = leak && !state.leak_suspected;
        state.leak_suspected = leak;
        let trend = state.window.trend_bytes_per_sec();
        drop(state);

        self.checkpoints.fetch_add(1, Ordering::Relaxed);

        if usage > hard {
            self.hard_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(usage_bytes = usage, hard_limit_bytes = hard, "memory usage above hard limit");
            let _ = self.events.send(MemoryEvent::HardLimitExceeded { usage_bytes: usage, limit_bytes: hard });
        }

        if crossed_soft {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(usage_bytes = usage, soft_limit_bytes = soft, "memory usage crossed soft limit");
            let _ = self.events.send(MemoryEvent::SoftLimitCrossed { usage_bytes: usage, limit_bytes: soft });
            self.trigger_cleanup("soft limit crossed");
        }

        if newly_leaking {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                usage_bytes = usage,
                trend_bytes_per_sec = trend,
                window = self.config.window_size,
                "memory usage grew across the whole sample window; possible leak"
            );
            let _ = self.events.send(MemoryEvent::LeakSuspected { usage_bytes: usage, trend_bytes_per_sec: trend });
        }

        sample
    }

    /// Check whether `additional_bytes` more can be allocated.
    ///
    /// # Errors
    ///
    /// Returns `MemoryLimitExceeded` when the projected usage is above the hard
    /// threshold. Cleanup is triggered in that case so a later retry may pass.
    pub fn check_limit(&self, additional_bytes: u64) -> Result<MemoryPressure, Error> {
        let projected = self.probe.current_usage()?.saturating_add(additional_bytes);

        if projected > self.config.hard_limit_bytes {
            self.hard_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                projected_bytes = projected,
                additional_bytes,
                hard_limit_bytes = self.config.hard_limit_bytes,
                "refusing allocation above hard memory limit"
            );
            let _ = self.events.send(MemoryEvent::HardLimitExceeded {
                usage_bytes: projected,
                limit_bytes: self.config.hard_limit_bytes,
            });
            self.trigger_cleanup("hard limit check failed");
            return Err(Error::MemoryLimitExceeded { usage: projected, limit: self.config.hard_limit_bytes });
        }

        if projected > self.config.soft_limit_bytes {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                projected_bytes = projected,
                additional_bytes,
                soft_limit_bytes = self.config.soft_limit_bytes,
                "allocation proceeds above soft memory limit"
            );
            return Ok(MemoryPressure::Elevated);
        }

        Ok(MemoryPressure::Normal)
    }

    /// Whether a cleanup run is queued or in progress.
    pub fn cleanup_running(&self) -> bool {
        self.cleanup.running.load(Ordering::Acquire)
    }

    fn trigger_cleanup(&self, reason: &'static str) {
        if self.cleanup.running.swap(true, Ordering::AcqRel) {
            tracing::debug!(reason, "memory cleanup already running");
            return;
        }
        let guard = RunningGuard(self.cleanup.clone());

        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner()).clone();
        if callbacks.is_empty() {
            return;
        }

        let cleanup = self.cleanup.clone();
        let task = async move {
            let _guard = guard;
            cleanup.runs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(reason, callbacks = callbacks.len(), "running memory cleanup");

            for (name, callback) in callbacks {
                match tokio::spawn(callback()).await {
                    Ok(Ok(())) => tracing::debug!(callback = %name, "cleanup callback finished"),
                    Ok(Err(e)) => {
                        cleanup.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(callback = %name, error = %e, "cleanup callback failed");
                    }
                    Err(e) => {
                        cleanup.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(callback = %name, error = %e, "cleanup callback panicked");
                    }
                }
            }

            Ok::<_, Error>(())
        };

        if let Err(e) = self.pool.submit(task) {
            tracing::warn!(reason, error = %e, "could not schedule memory cleanup");
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        MemoryStats {
            current_bytes: state.window.latest().map_or(0, |s| s.usage_bytes),
            peak_bytes: state.peak,
            soft_limit_bytes: self.config.soft_limit_bytes,
            hard_limit_bytes: self.config.hard_limit_bytes,
            trend_bytes_per_sec: state.window.trend_bytes_per_sec(),
            window_len: state.window.len(),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            hard_limit_hits: self.hard_limit_hits.load(Ordering::Relaxed),
            cleanup_callbacks: self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len(),
            cleanup_runs: self.cleanup.runs.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup.failures.load(Ordering::Relaxed),
            leak_suspected: state.leak_suspected,
        }
    }
}
