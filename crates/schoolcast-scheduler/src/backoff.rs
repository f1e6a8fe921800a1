//! Backoff scheduler — one cancellable countdown per break.
//!
//! Each [`BackoffScheduler::schedule`] call samples a fresh duration from the
//! [`BreakWindow`], reports the remaining seconds once per second and fires
//! the elapsed callback exactly once. The returned [`BreakHandle`] owns the
//! countdown task: cancelling or dropping it stops the countdown for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use rand::Rng;
use schoolcast_core::config::DispatchConfig;
use schoolcast_core::error::{Result, SchoolCastError};
use tokio::task::JoinHandle;

const RUNNING: u8 = 0;
const ELAPSED: u8 = 1;
const CANCELLED: u8 = 2;

/// Closed range of break durations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakWindow {
    min_secs: u64,
    max_secs: u64,
}

impl BreakWindow {
    pub fn new(min_secs: u64, max_secs: u64) -> Result<Self> {
        if min_secs > max_secs {
            return Err(SchoolCastError::Config(format!(
                "break window [{min_secs}, {max_secs}] is empty"
            )));
        }
        Ok(Self { min_secs, max_secs })
    }

    pub fn min_secs(&self) -> u64 {
        self.min_secs
    }

    pub fn max_secs(&self) -> u64 {
        self.max_secs
    }

    /// Uniform sample from `[min_secs, max_secs]`.
    pub fn sample(&self) -> u64 {
        rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
    }
}

impl Default for BreakWindow {
    fn default() -> Self {
        Self {
            min_secs: 120,
            max_secs: 180,
        }
    }
}

/// Starts randomized break countdowns.
#[derive(Debug, Clone, Default)]
pub struct BackoffScheduler {
    window: BreakWindow,
}

impl BackoffScheduler {
    pub fn new(window: BreakWindow) -> Self {
        Self { window }
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        Ok(Self::new(BreakWindow::new(
            config.break_min_secs,
            config.break_max_secs,
        )?))
    }

    pub fn window(&self) -> BreakWindow {
        self.window
    }

    /// Start a countdown.
    ///
    /// `on_tick(remaining)` runs immediately with the sampled duration and
    /// then once per second down to 1; `on_elapsed` runs once when the
    /// countdown reaches 0. Must be called from within a Tokio runtime.
    pub fn schedule<T, E>(&self, mut on_tick: T, on_elapsed: E) -> BreakHandle
    where
        T: FnMut(u64) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let duration_secs = self.window.sample();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let task_state = state.clone();

        tracing::debug!("⏳ Break scheduled: {}s", duration_secs);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut remaining = duration_secs;

            while remaining > 0 {
                interval.tick().await;
                if task_state.load(Ordering::Acquire) != RUNNING {
                    return;
                }
                on_tick(remaining);
                remaining -= 1;
            }
            if duration_secs > 0 {
                interval.tick().await;
            }

            if task_state
                .compare_exchange(RUNNING, ELAPSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                on_elapsed();
            }
        });

        BreakHandle {
            state,
            task,
            duration_secs,
        }
    }
}

/// Ownership of one running countdown. Dropping the handle cancels it.
#[derive(Debug)]
pub struct BreakHandle {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
    duration_secs: u64,
}

impl BreakHandle {
    /// Sampled duration of this break.
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    /// True once the countdown elapsed or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Stop the countdown. Returns `false` if it had already elapsed or been
    /// cancelled. Once this returns, the elapsed callback can no longer fire.
    pub fn cancel(&self) -> bool {
        let stopped = self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.task.abort();
        if stopped {
            tracing::debug!("⏹️ Break cancelled");
        }
        stopped
    }
}

impl Drop for BreakHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
