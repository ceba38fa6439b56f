//! Per-context rooting ledger.
//!
//! Engine handles referenced only from the host side are invisible to the
//! engine's collector, so they are protected explicitly and tracked here.
//! The ledger is the one place that can guarantee no host-to-engine root
//! outlives its context: teardown unroots every remaining entry
//! unconditionally, covering proxies that outlive the expected release
//! order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{ContextId, EngineBackend, RawHandle};
use crate::sched::Scheduler;

/// Rooted-handle state shared between the owning [`Protected`] and the
/// ledger. `released` flips exactly once, under whichever path gets there
/// first.
pub(crate) struct ProtectedState {
    entry: u64,
    handle: RawHandle,
    released: AtomicBool,
}

/// Bridge-private side of an execution context: the rooting ledger plus
/// the module cache, both cleared in one shot at teardown.
pub(crate) struct ContextPrivate {
    ctx: ContextId,
    backend: Arc<dyn EngineBackend>,
    scheduler: Scheduler,
    ledger: Mutex<HashMap<u64, Arc<ProtectedState>>>,
    modules: Mutex<HashMap<PathBuf, Protected>>,
    next_entry: AtomicU64,
    torn_down: AtomicBool,
}

impl ContextPrivate {
    pub fn new(ctx: ContextId, backend: Arc<dyn EngineBackend>, scheduler: Scheduler) -> Arc<Self> {
        Arc::new(ContextPrivate {
            ctx,
            backend,
            scheduler,
            ledger: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn ctx(&self) -> ContextId {
        self.ctx
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn find_module(&self, path: &Path) -> Option<RawHandle> {
        self.modules.lock().get(path).and_then(|p| p.handle())
    }

    pub fn add_module(&self, path: PathBuf, exports: Protected) {
        self.modules.lock().insert(path, exports);
    }

    /// Unroots every remaining ledger entry and clears the module cache.
    /// Called exactly once, before the context itself is released.
    pub fn teardown_all(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut *self.ledger.lock());
        let modules = std::mem::take(&mut *self.modules.lock());
        debug!(
            roots = entries.len(),
            modules = modules.len(),
            "tearing down context roots"
        );
        for state in entries.into_values() {
            if !state.released.swap(true, Ordering::AcqRel) {
                self.backend.unprotect(self.ctx, state.handle);
            }
        }
        // Module cache entries were rooted through the same ledger; their
        // Protected handles are already spent and drop as no-ops.
        drop(modules);
    }

    fn release_entry(&self, state: &ProtectedState) {
        if state.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ledger.lock().remove(&state.entry);
        self.backend.unprotect(self.ctx, state.handle);
    }
}

/// RAII rooted engine handle. Rooting happens at construction; unrooting
/// on drop is deferred onto the dispatch queue because drops can happen
/// inside engine finalizers or on foreign threads, where the engine must
/// not be entered.
pub(crate) struct Protected {
    state: Arc<ProtectedState>,
    owner: Arc<ContextPrivate>,
}

impl Protected {
    /// Protects `handle` against collection and records it in the ledger.
    /// Returns `None` when the context is already torn down.
    pub fn root(owner: &Arc<ContextPrivate>, handle: RawHandle) -> Option<Protected> {
        if owner.is_torn_down() {
            return None;
        }
        let entry = owner.next_entry.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ProtectedState {
            entry,
            handle,
            released: AtomicBool::new(false),
        });
        owner.backend.protect(owner.ctx, handle);
        owner.ledger.lock().insert(entry, state.clone());
        Some(Protected {
            state,
            owner: owner.clone(),
        })
    }

    /// The rooted handle, or `None` once the root has been released.
    pub fn handle(&self) -> Option<RawHandle> {
        if self.state.released.load(Ordering::Acquire) {
            None
        } else {
            Some(self.state.handle)
        }
    }

    pub fn ctx(&self) -> ContextId {
        self.owner.ctx
    }

    pub fn owner(&self) -> &Arc<ContextPrivate> {
        &self.owner
    }
}

impl Drop for Protected {
    fn drop(&mut self) {
        if self.state.released.load(Ordering::Acquire) {
            return;
        }
        let scheduler = self.owner.scheduler.clone();
        let owner = self.owner.clone();
        let state = self.state.clone();
        scheduler.post(move || owner.release_entry(&state));
    }
}
