//! Engine-side wrappers around host objects and functions.
//!
//! Wrapping goes through an identity cache: one host object gets at most
//! one live wrapper per context group, so scripts can compare bridged
//! references with `===`. The cache holds weak engine references only and
//! evicts stale entries lazily on the next lookup, never from inside the
//! collector.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use crate::context::BridgeShared;
use crate::convert;
use crate::engine::{
    ClassId, ClassSpec, ContextId, EngineError, GroupId, HandleKind, PrivateToken, RawHandle,
    WeakHandle, WrapperHooks,
};
use crate::host::{self, object_identity, FunctionRef, HostFunction, ObjectRef};
use crate::promise;
use crate::value::Value;
use crate::BridgeResult;

/// Per-wrapper state keyed by the private token the engine hands back on
/// every trap. Holding the `Value` keeps the host reference alive for the
/// wrapper's lifetime.
pub(crate) struct WrapperState {
    pub value: Value,
    /// Bridged native promises handed out for promise-like properties,
    /// keyed by property name. Re-reading the same property yields the
    /// same promise as long as the underlying host object is unchanged
    /// and the engine has not collected it.
    pub promises: HashMap<String, PromiseSlot>,
}

pub(crate) struct PromiseSlot {
    pub identity: usize,
    pub weak: WeakHandle,
    pub group: GroupId,
}

/// Identity-cache entry: a weak reference to the wrapper, valid within one
/// context group.
pub(crate) struct CacheEntry {
    pub group: GroupId,
    pub weak: WeakHandle,
}

pub(crate) fn wrap_object(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    obj: &ObjectRef,
) -> BridgeResult<RawHandle> {
    if host::is_promise_like(obj) {
        return promise::bridge_promise(shared, ctx, obj);
    }
    let backend = &shared.backend;
    let group = backend.context_group(ctx);
    let identity = object_identity(obj);

    let stale = {
        let mut cache = shared.wrapper_cache.lock();
        match cache.get(&identity).map(|e| (e.group, e.weak)) {
            Some((cached_group, weak)) if cached_group == group => {
                if let Some(handle) = backend.weak_target(group, weak) {
                    return Ok(handle);
                }
                cache.remove(&identity)
            }
            Some(_) => cache.remove(&identity),
            None => None,
        }
    };
    if let Some(entry) = stale {
        backend.release_weak(entry.group, entry.weak);
    }

    // Array-like objects become real engine arrays instead of wrappers;
    // those are built fresh per conversion and never cached.
    if let Some(desc) = obj.descriptor() {
        if desc.array_like {
            return flatten_array(shared, ctx, obj);
        }
    }

    let class = object_class_for(shared, obj);
    let token = shared.alloc_token();
    shared.wrappers.lock().insert(
        token.0,
        WrapperState {
            value: Value::Object(obj.clone()),
            promises: HashMap::new(),
        },
    );
    let handle = backend.make_wrapper(ctx, class, token);
    let weak = backend.make_weak(ctx, handle);
    let prior = shared
        .wrapper_cache
        .lock()
        .insert(identity, CacheEntry { group, weak });
    if let Some(prior) = prior {
        backend.release_weak(prior.group, prior.weak);
    }
    Ok(handle)
}

pub(crate) fn wrap_function(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    func: &FunctionRef,
) -> BridgeResult<RawHandle> {
    let class = *shared.function_class.get_or_init(|| {
        shared.backend.define_class(ClassSpec {
            name: "HostFunction".into(),
            static_properties: Vec::new(),
            callable: true,
            hooks: Arc::new(BridgeHooks {
                shared: Arc::downgrade(shared),
            }),
        })
    });
    let token = shared.alloc_token();
    shared.wrappers.lock().insert(
        token.0,
        WrapperState {
            value: Value::Function(func.clone()),
            promises: HashMap::new(),
        },
    );
    Ok(shared.backend.make_wrapper(ctx, class, token))
}

fn flatten_array(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    obj: &ObjectRef,
) -> BridgeResult<RawHandle> {
    let length = match obj.get("length") {
        Ok(v) => v.as_number().unwrap_or(0.0) as u32,
        Err(e) => {
            debug!("array-like object without a readable length: {e}");
            0
        }
    };
    let mut items = Vec::with_capacity(length as usize);
    for index in 0..length {
        let element = obj.get_index(index).unwrap_or_default();
        items.push(convert::to_engine(shared, ctx, &element)?);
    }
    Ok(shared.backend.make_array(ctx, &items))
}

/// Picks (defining on first use) the engine class for a host object.
/// Descriptor-carrying classes get a static property table memoized by
/// descriptor identity; dynamic or descriptor-less objects share one
/// generic trap-everything class.
fn object_class_for(shared: &Arc<BridgeShared>, obj: &ObjectRef) -> ClassId {
    match obj.descriptor() {
        Some(desc) if !desc.dynamic => {
            let key = host::descriptor_identity(&desc);
            let mut cache = shared.class_cache.lock();
            if let Some(class) = cache.get(&key) {
                return *class;
            }
            let class = shared.backend.define_class(ClassSpec {
                name: desc.class_name.clone(),
                static_properties: desc.flatten(),
                callable: false,
                hooks: Arc::new(BridgeHooks {
                    shared: Arc::downgrade(shared),
                }),
            });
            cache.insert(key, class);
            class
        }
        _ => *shared.object_class.get_or_init(|| {
            shared.backend.define_class(ClassSpec {
                name: "HostObject".into(),
                static_properties: Vec::new(),
                callable: false,
                hooks: Arc::new(BridgeHooks {
                    shared: Arc::downgrade(shared),
                }),
            })
        }),
    }
}

/// Returns `toString` machinery the engine expects from any object: the
/// description of the wrapped host object as a zero-argument function.
struct DescribeFn {
    target: ObjectRef,
}

impl HostFunction for DescribeFn {
    fn send(&self, _args: &[Value]) -> BridgeResult<Option<Value>> {
        Ok(Some(Value::String(
            self.target.description().unwrap_or_default(),
        )))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The single trap table behind every wrapper class. Holds the bridge
/// weakly: traps arriving after runtime shutdown fall through to
/// `undefined`.
pub(crate) struct BridgeHooks {
    shared: Weak<BridgeShared>,
}

impl WrapperHooks for BridgeHooks {
    fn get(&self, ctx: ContextId, token: PrivateToken, name: &str) -> Option<RawHandle> {
        let shared = self.shared.upgrade()?;
        let backend = &shared.backend;
        // Engine protocol probes that must not reach the host object.
        match name {
            "Symbol.toPrimitive" | "valueOf" | "toJSON" => return Some(backend.undefined(ctx)),
            _ => {}
        }
        let obj = match shared.wrapper_value(token)? {
            Value::Object(obj) => obj,
            // Function wrappers answer the call trap only.
            _ => return None,
        };
        if name == "toString" {
            let describe: FunctionRef = Arc::new(DescribeFn { target: obj });
            return wrap_function(&shared, ctx, &describe).ok();
        }
        let fetched = if name.starts_with(|c: char| c.is_ascii_digit()) {
            match name.parse::<u32>() {
                Ok(index) => obj.get_index(index),
                Err(_) => obj.get(name),
            }
        } else {
            obj.get(name)
        };
        let value = match fetched {
            Ok(value) => value,
            Err(e) => {
                debug!("property {name} not readable: {e}");
                return None;
            }
        };
        if let Value::Object(inner) = &value {
            if host::is_promise_like(inner) {
                return promise_property(&shared, ctx, token, name, inner);
            }
        }
        convert::to_engine(&shared, ctx, &value).ok()
    }

    fn set(&self, ctx: ContextId, token: PrivateToken, name: &str, value: RawHandle) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let Some(Value::Object(obj)) = shared.wrapper_value(token) else {
            return false;
        };
        let converted = match convert::to_host(&shared, ctx, value) {
            Ok(v) => v,
            Err(e) => {
                warn!("cannot convert value assigned to {name}: {e}");
                return false;
            }
        };
        let result = if name.starts_with(|c: char| c.is_ascii_digit()) {
            match name.parse::<u32>() {
                Ok(index) => obj.set_index(index, converted),
                Err(_) => obj.set(name, converted),
            }
        } else {
            obj.set(name, converted)
        };
        if let Err(e) = result {
            // Writes are tolerant: the failure is logged, the script
            // continues without an exception.
            warn!("set {name} failed: {e}");
        }
        true
    }

    fn property_names(&self, _ctx: ContextId, token: PrivateToken) -> Vec<String> {
        let Some(shared) = self.shared.upgrade() else {
            return Vec::new();
        };
        let Some(Value::Object(obj)) = shared.wrapper_value(token) else {
            return Vec::new();
        };
        if let Some(keys) = obj.keys() {
            return keys;
        }
        // Objects without key enumeration may still be walkable through a
        // numeric length.
        match obj.get("length") {
            Ok(v) => {
                let len = v.as_number().unwrap_or(0.0) as u32;
                (0..len).map(|i| i.to_string()).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    fn call(
        &self,
        ctx: ContextId,
        token: PrivateToken,
        _this: RawHandle,
        args: &[RawHandle],
    ) -> Result<RawHandle, EngineError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| EngineError::exception("bridge is gone"))?;
        let func = match shared.wrapper_value(token) {
            Some(Value::Function(func)) => func,
            _ => return Err(EngineError::exception("not callable")),
        };
        let mut converted = Vec::with_capacity(args.len());
        for arg in args {
            let value = convert::to_host(&shared, ctx, *arg)
                .map_err(|e| EngineError::exception(format!("cannot convert argument: {e}")))?;
            converted.push(value);
        }
        match func.send(&converted) {
            Ok(Some(value)) => convert::to_engine(&shared, ctx, &value)
                .map_err(|e| EngineError::exception(e.to_string())),
            Ok(None) => Ok(shared.backend.undefined(ctx)),
            Err(e) => {
                error!("native call failed: {e}");
                Err(EngineError::exception("native call failed"))
            }
        }
    }

    fn to_string_hint(&self, _ctx: ContextId, token: PrivateToken) -> Option<String> {
        let shared = self.shared.upgrade()?;
        match shared.wrapper_value(token)? {
            Value::Object(obj) => obj.description(),
            _ => None,
        }
    }

    fn finalize(&self, token: PrivateToken) {
        // Runs inside the collector: defer everything, including dropping
        // the host reference, onto the dispatch queue.
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let weak_shared = self.shared.clone();
        shared.scheduler.post(move || {
            let Some(shared) = weak_shared.upgrade() else {
                return;
            };
            let backend = &shared.backend;
            let Some(state) = shared.wrappers.lock().remove(&token.0) else {
                return;
            };
            let WrapperState { value, promises } = state;
            for slot in promises.into_values() {
                backend.release_weak(slot.group, slot.weak);
            }
            if let Value::Object(obj) = &value {
                let identity = object_identity(obj);
                let dead = {
                    let mut cache = shared.wrapper_cache.lock();
                    match cache.get(&identity).map(|e| (e.group, e.weak)) {
                        // Only evict if the weak really died; the object may
                        // have been re-wrapped since this finalizer ran.
                        Some((group, weak)) if backend.weak_target(group, weak).is_none() => {
                            cache.remove(&identity)
                        }
                        _ => None,
                    }
                };
                if let Some(entry) = dead {
                    backend.release_weak(entry.group, entry.weak);
                }
            }
        });
    }
}

/// Re-reads a promise-like property, reusing the previously bridged native
/// promise when the host still returns the same object and the engine has
/// not collected the bridge result.
fn promise_property(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    token: PrivateToken,
    name: &str,
    obj: &ObjectRef,
) -> Option<RawHandle> {
    let backend = &shared.backend;
    let group = backend.context_group(ctx);
    let identity = object_identity(obj);

    let stale = {
        let mut wrappers = shared.wrappers.lock();
        let state = wrappers.get_mut(&token.0)?;
        match state
            .promises
            .get(name)
            .map(|s| (s.identity, s.group, s.weak))
        {
            Some((cached_identity, cached_group, weak))
                if cached_identity == identity && cached_group == group =>
            {
                if let Some(handle) = backend.weak_target(group, weak) {
                    return Some(handle);
                }
                state.promises.remove(name)
            }
            Some(_) => state.promises.remove(name),
            None => None,
        }
    };
    if let Some(slot) = stale {
        backend.release_weak(slot.group, slot.weak);
    }

    let bridged = match promise::bridge_promise(shared, ctx, obj) {
        Ok(handle) => handle,
        Err(e) => {
            error!("promise bridge failed for {name}: {e}");
            return None;
        }
    };
    // Subscription failures surface as null; nothing to cache then.
    if backend.kind(ctx, bridged) != HandleKind::Object {
        return Some(bridged);
    }
    let weak = backend.make_weak(ctx, bridged);
    let mut wrappers = shared.wrappers.lock();
    if let Some(state) = wrappers.get_mut(&token.0) {
        if let Some(prior) = state.promises.insert(
            name.to_owned(),
            PromiseSlot {
                identity,
                weak,
                group,
            },
        ) {
            backend.release_weak(prior.group, prior.weak);
        }
    } else {
        backend.release_weak(group, weak);
    }
    Some(bridged)
}
