//! Runtime and context lifecycle, plus the script-visible global bindings.
//!
//! One [`ScriptRuntime`] owns the dispatch queue, the wrapper caches, and
//! a single engine context group shared by every context it creates. The
//! group is reference counted against live contexts; the last context to
//! drop releases it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::convert;
use crate::engine::{ClassId, ContextId, EngineBackend, GroupId, PrivateToken};
use crate::host::{FunctionRef, HostFunction};
use crate::modules::{ModuleLoader, ModuleOptions, RequireFn};
use crate::roots::ContextPrivate;
use crate::sched::{log_dispatch_error, Scheduler};
use crate::value::Value;
use crate::wrapper::{CacheEntry, WrapperState};
use crate::{BridgeError, BridgeResult};

/// Runtime-wide settings.
#[derive(Clone, Debug, Default)]
pub struct BridgeOptions {
    pub modules: ModuleOptions,
}

struct GroupState {
    id: GroupId,
    refs: usize,
}

/// State shared by the runtime, its contexts, proxies, and wrapper hooks.
/// Hooks and loaders hold it weakly; only the runtime and live contexts
/// keep it alive.
pub(crate) struct BridgeShared {
    pub backend: Arc<dyn EngineBackend>,
    pub scheduler: Scheduler,
    pub options: BridgeOptions,
    pub wrappers: Mutex<HashMap<u64, WrapperState>>,
    /// Host object identity to live wrapper, one per context group.
    pub wrapper_cache: Mutex<HashMap<usize, CacheEntry>>,
    /// Descriptor identity to engine class with a static property table.
    pub class_cache: Mutex<HashMap<usize, ClassId>>,
    pub object_class: OnceCell<ClassId>,
    pub function_class: OnceCell<ClassId>,
    contexts: Mutex<HashMap<ContextId, Weak<ContextPrivate>>>,
    group: Mutex<Option<GroupState>>,
    next_token: AtomicU64,
    eval_count: AtomicU64,
}

impl BridgeShared {
    pub fn wrapper_value(&self, token: PrivateToken) -> Option<Value> {
        self.wrappers.lock().get(&token.0).map(|s| s.value.clone())
    }

    pub fn alloc_token(&self) -> PrivateToken {
        PrivateToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn context_private(&self, ctx: ContextId) -> Option<Arc<ContextPrivate>> {
        self.contexts.lock().get(&ctx).and_then(Weak::upgrade)
    }

    fn next_eval(&self) -> u64 {
        self.eval_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn acquire_group(&self) -> GroupId {
        let mut group = self.group.lock();
        match group.as_mut() {
            Some(state) => {
                state.refs += 1;
                state.id
            }
            None => {
                let id = self.backend.create_group();
                *group = Some(GroupState { id, refs: 1 });
                id
            }
        }
    }

    fn release_group_ref(&self) {
        let mut group = self.group.lock();
        if let Some(state) = group.as_mut() {
            state.refs -= 1;
            if state.refs == 0 {
                let id = state.id;
                *group = None;
                self.backend.release_group(id);
            }
        }
    }
}

/// Owner of the bridge: backend, scheduler, caches. Contexts created from
/// it stay valid after the runtime value is dropped; they share the same
/// inner state.
pub struct ScriptRuntime {
    shared: Arc<BridgeShared>,
}

impl ScriptRuntime {
    pub fn new(backend: Arc<dyn EngineBackend>) -> ScriptRuntime {
        Self::with_options(backend, BridgeOptions::default())
    }

    pub fn with_options(backend: Arc<dyn EngineBackend>, options: BridgeOptions) -> ScriptRuntime {
        ScriptRuntime {
            shared: Arc::new(BridgeShared {
                backend,
                scheduler: Scheduler::new(),
                options,
                wrappers: Mutex::new(HashMap::new()),
                wrapper_cache: Mutex::new(HashMap::new()),
                class_cache: Mutex::new(HashMap::new()),
                object_class: OnceCell::new(),
                function_class: OnceCell::new(),
                contexts: Mutex::new(HashMap::new()),
                group: Mutex::new(None),
                next_token: AtomicU64::new(0),
                eval_count: AtomicU64::new(0),
            }),
        }
    }

    /// Drains deferred releases, queued continuations, and due timers.
    /// Call this from the embedder's main loop, on the engine thread.
    pub fn pump(&self) {
        self.shared.scheduler.pump();
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Creates a context in the shared group with the standard globals
    /// (`require`, timers) installed.
    pub fn create_context(&self) -> BridgeResult<ScriptContext> {
        let shared = &self.shared;
        let group = shared.acquire_group();
        let ctx = shared.backend.create_context(group);
        let private = ContextPrivate::new(ctx, shared.backend.clone(), shared.scheduler.clone());
        shared.contexts.lock().insert(ctx, Arc::downgrade(&private));
        let loader = Arc::new(ModuleLoader::new(
            shared,
            &private,
            shared.options.modules.clone(),
        ));
        let context = ScriptContext {
            shared: shared.clone(),
            ctx,
            private,
            loader,
        };
        context.install_globals()?;
        Ok(context)
    }
}

/// One script execution realm. Dropping it tears down every host-held
/// root, runs a final collection, and destroys the engine context.
pub struct ScriptContext {
    shared: Arc<BridgeShared>,
    ctx: ContextId,
    private: Arc<ContextPrivate>,
    loader: Arc<ModuleLoader>,
}

impl ScriptContext {
    /// Engine-side id of this context, for embedders that also talk to the
    /// backend directly.
    pub fn id(&self) -> ContextId {
        self.ctx
    }

    /// Installs `value` as a non-enumerable global binding.
    pub fn add_global(&self, name: &str, value: Value) -> BridgeResult<()> {
        let handle = convert::to_engine(&self.shared, self.ctx, &value)?;
        let global = self.shared.backend.global_object(self.ctx);
        self.shared
            .backend
            .set_property(self.ctx, global, name, handle, false)
            .map_err(|e| BridgeError::Script(e.message))
    }

    /// Reads a global binding back as a host value.
    pub fn global(&self, name: &str) -> BridgeResult<Value> {
        let global = self.shared.backend.global_object(self.ctx);
        let handle = self
            .shared
            .backend
            .get_property(self.ctx, global, name)
            .map_err(|e| BridgeError::Script(e.message))?;
        convert::to_host(&self.shared, self.ctx, handle)
    }

    pub fn run_script(&self, source: &str) -> BridgeResult<Value> {
        self.evaluate(source, "<eval>")
    }

    pub fn run_file(&self, path: impl AsRef<Path>) -> BridgeResult<Value> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        if source.is_empty() {
            return Err(BridgeError::Io(format!("{} is empty", path.display())));
        }
        self.evaluate(&source, &path.to_string_lossy())
    }

    /// Same loader the script-visible `require` uses; failures come back
    /// as empty.
    pub fn require(&self, name: &str) -> Value {
        self.loader.require(name)
    }

    fn evaluate(&self, source: &str, name: &str) -> BridgeResult<Value> {
        // Number evaluations so engine tooling can tell them apart.
        let label = format!("eval{}: {name}", self.shared.next_eval());
        self.shared.backend.set_context_name(self.ctx, &label);
        let result = self
            .shared
            .backend
            .evaluate(self.ctx, source, name)
            .map_err(|e| {
                error!("evaluation of {name} failed: {}", e.message);
                BridgeError::Script(e.message)
            })?;
        convert::to_host(&self.shared, self.ctx, result)
    }

    fn install_globals(&self) -> BridgeResult<()> {
        let scheduler = self.shared.scheduler.clone();
        self.add_global(
            "require",
            Value::Function(Arc::new(RequireFn {
                loader: self.loader.clone(),
            })),
        )?;
        self.add_global(
            "setTimeout",
            Value::Function(Arc::new(TimerInstallFn {
                scheduler: scheduler.clone(),
                repeat: false,
            })),
        )?;
        self.add_global(
            "setInterval",
            Value::Function(Arc::new(TimerInstallFn {
                scheduler: scheduler.clone(),
                repeat: true,
            })),
        )?;
        // Timeouts and intervals share one tag namespace, so both clear
        // bindings are the same function.
        let clear: FunctionRef = Arc::new(TimerClearFn { scheduler });
        self.add_global("clearTimeout", Value::Function(clear.clone()))?;
        self.add_global("clearInterval", Value::Function(clear))
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        debug!("destroying script context");
        self.shared.contexts.lock().remove(&self.ctx);
        self.private.teardown_all();
        self.shared.backend.garbage_collect(self.ctx);
        self.shared.backend.destroy_context(self.ctx);
        self.shared.release_group_ref();
    }
}

/// `setTimeout` / `setInterval`. Arguments past the interval are forwarded
/// to the callback on every fire.
struct TimerInstallFn {
    scheduler: Scheduler,
    repeat: bool,
}

impl HostFunction for TimerInstallFn {
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>> {
        let Some(Value::Function(callback)) = args.first().cloned() else {
            return Err(BridgeError::InvalidArgument("timer callback".into()));
        };
        let interval = args.get(1).and_then(Value::as_number).unwrap_or(0.0);
        let extra: Vec<Value> = args.iter().skip(2).cloned().collect();
        let tag = self
            .scheduler
            .install_timeout(interval, self.repeat, move || {
                if let Err(e) = callback.send(&extra) {
                    log_dispatch_error("timer callback", e);
                }
            });
        Ok(Some(Value::from(tag)))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// `clearTimeout` / `clearInterval`.
struct TimerClearFn {
    scheduler: Scheduler,
}

impl HostFunction for TimerClearFn {
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>> {
        // The tag coerces like an unsigned integer; anything that will
        // not coerce is ignored, never an exception.
        match args.first() {
            Some(Value::Number(tag)) => {
                self.scheduler.clear_timeout(*tag as u32);
                Ok(None)
            }
            Some(Value::String(s)) => {
                match s.trim().parse::<f64>() {
                    Ok(tag) => self.scheduler.clear_timeout(tag as u32),
                    Err(_) => warn!("clear timer called with a non-numeric tag {s:?}"),
                }
                Ok(None)
            }
            Some(Value::Empty) | None => {
                warn!("clear timer called without a tag");
                Ok(None)
            }
            Some(other) => {
                warn!("clear timer called with a {} tag", other.type_name());
                Ok(None)
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
