//! Dispatch queue and timer subsystem.
//!
//! All engine work happens on one logical thread. Foreign threads (async
//! host completions, finalizers) never touch engine state directly; they
//! `post` closures here, and the embedder's repeated `pump()` calls drain
//! them on the engine thread. The queue mutex is held only to swap the
//! pending list, never across callback execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Repeating timers with a zero interval are floored to this to avoid a
/// busy loop.
pub const MIN_REPEAT_INTERVAL_MS: f64 = 10.0;

type Task = Box<dyn FnOnce() + Send + 'static>;
type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    fire_at: Instant,
    interval: Duration,
    repeat: bool,
    callback: TimerCallback,
}

#[derive(Default)]
struct SchedulerInner {
    pending: Mutex<Vec<Task>>,
    timers: Mutex<HashMap<u32, TimerEntry>>,
    next_tag: AtomicU32,
    pumping: AtomicBool,
}

/// Single-consumer scheduler shared by every context of a runtime.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread-safe enqueue; the closure runs during the next `pump` on the
    /// engine thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pending.lock().push(Box::new(task));
    }

    /// Drains deferred work, then fires due timers. Never re-entered: a
    /// callback calling `pump` is a no-op, and work it posts waits for the
    /// next drain.
    pub fn pump(&self) {
        if self.inner.pumping.swap(true, Ordering::Acquire) {
            return;
        }
        self.drain_pending();
        self.fire_timers(Instant::now());
        self.inner.pumping.store(false, Ordering::Release);
    }

    /// Installs a one-shot or repeating timer; returns its cancel tag.
    /// Negative intervals clamp to zero.
    pub fn install_timeout(
        &self,
        interval_ms: f64,
        repeat: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> u32 {
        let mut interval_ms = if interval_ms.is_finite() && interval_ms > 0.0 {
            interval_ms
        } else {
            0.0
        };
        if interval_ms == 0.0 && repeat {
            interval_ms = MIN_REPEAT_INTERVAL_MS;
        }
        let interval = Duration::from_secs_f64(interval_ms / 1000.0);

        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.timers.lock().insert(
            tag,
            TimerEntry {
                fire_at: Instant::now() + interval,
                interval,
                repeat,
                callback: Arc::new(callback),
            },
        );
        tag
    }

    /// Cancels a timer; unknown tags are a no-op.
    pub fn clear_timeout(&self, tag: u32) {
        self.inner.timers.lock().remove(&tag);
    }

    pub fn timer_count(&self) -> usize {
        self.inner.timers.lock().len()
    }

    fn drain_pending(&self) {
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for task in pending {
            task();
        }
    }

    fn fire_timers(&self, now: Instant) {
        // Snapshot due tags first; a fired callback may cancel or install
        // timers, so every entry is re-checked under the lock before it
        // runs.
        let mut due: Vec<(Instant, u32)> = self
            .inner
            .timers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.fire_at <= now)
            .map(|(tag, entry)| (entry.fire_at, *tag))
            .collect();
        due.sort();

        for (_, tag) in due {
            let callback = {
                let mut timers = self.inner.timers.lock();
                match timers.get_mut(&tag) {
                    Some(entry) if entry.fire_at <= now => {
                        let callback = entry.callback.clone();
                        if entry.repeat {
                            // Re-arm from the scheduled fire time, not from
                            // "now": late pumps do not accumulate drift. A
                            // pump delayed past several periods skips the
                            // backlog instead of firing a burst.
                            entry.fire_at += entry.interval;
                            while entry.fire_at <= now {
                                entry.fire_at += entry.interval;
                            }
                        } else {
                            timers.remove(&tag);
                        }
                        Some(callback)
                    }
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

/// Convenience used by callbacks that only need to log a failure.
pub(crate) fn log_dispatch_error<E: std::fmt::Display>(what: &str, err: E) {
    warn!("{what} dispatch failed: {err}");
}
