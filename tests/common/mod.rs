//! In-memory script engine used by the integration tests.
//!
//! Implements the full embedding contract over a slot table: plain
//! objects, arrays, native functions, wrapper classes with trap dispatch,
//! protect counts, weak references, promise capabilities with first-wins
//! settlement, and an explicit mark-and-sweep collector that runs wrapper
//! finalizers. Script evaluation is pluggable per test through
//! [`StubEngine::set_eval_handler`].

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crossrt::engine::ClassId;
use crossrt::{
    ClassSpec, ContextId, EngineBackend, EngineError, GroupId, HandleKind, PrivateToken,
    PromiseCapability, RawHandle, WeakHandle, WrapperHooks,
};

const UNDEFINED: RawHandle = RawHandle(1);
const NULL: RawHandle = RawHandle(2);

const RESERVED: &[&str] = &["toString", "valueOf", "toJSON", "Symbol.toPrimitive"];

pub type EvalHandler =
    dyn Fn(&StubEngine, ContextId, &str, &str) -> Result<RawHandle, EngineError> + Send + Sync;
pub type NativeImpl = dyn Fn(&StubEngine, ContextId, Option<RawHandle>, &[RawHandle]) -> Result<RawHandle, EngineError>
    + Send
    + Sync;

enum Callable {
    Native(Arc<NativeImpl>),
    Settle { promise: u64, resolved: bool },
}

struct PromiseState {
    settled: Option<(bool, RawHandle)>,
    attempts: u32,
}

#[derive(Default)]
struct ObjectData {
    props: IndexMap<String, (RawHandle, bool)>,
    elements: Option<Vec<RawHandle>>,
    date_repr: Option<String>,
    class: Option<ClassId>,
    private: Option<PrivateToken>,
    callable: Option<Callable>,
    promise: Option<PromiseState>,
}

enum SlotData {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(ObjectData),
}

struct Slot {
    data: SlotData,
    protect: usize,
}

struct CtxData {
    group: GroupId,
    global: RawHandle,
    name: String,
}

#[derive(Default)]
struct EngineState {
    slots: HashMap<u64, Slot>,
    weaks: HashMap<u64, u64>,
    contexts: HashMap<u64, CtxData>,
    live_groups: HashSet<u64>,
    next_id: u64,
}

struct StoredClass {
    statics: Vec<String>,
    callable: bool,
    hooks: Arc<dyn WrapperHooks>,
}

pub struct StubEngine {
    state: Mutex<EngineState>,
    classes: Mutex<HashMap<u64, Arc<StoredClass>>>,
    eval: Mutex<Option<Arc<EvalHandler>>>,
}

enum CallTarget {
    Native(Arc<NativeImpl>),
    Settle { promise: u64, resolved: bool },
    Hooks(Arc<dyn WrapperHooks>, PrivateToken),
}

impl StubEngine {
    pub fn new() -> Arc<StubEngine> {
        let engine = StubEngine {
            state: Mutex::new(EngineState::default()),
            classes: Mutex::new(HashMap::new()),
            eval: Mutex::new(None),
        };
        {
            let mut state = engine.state.lock();
            state.next_id = 2;
            state.slots.insert(
                UNDEFINED.0,
                Slot {
                    data: SlotData::Undefined,
                    protect: 1,
                },
            );
            state.slots.insert(
                NULL.0,
                Slot {
                    data: SlotData::Null,
                    protect: 1,
                },
            );
        }
        Arc::new(engine)
    }

    pub fn set_eval_handler(
        &self,
        handler: impl Fn(&StubEngine, ContextId, &str, &str) -> Result<RawHandle, EngineError>
            + Send
            + Sync
            + 'static,
    ) {
        *self.eval.lock() = Some(Arc::new(handler));
    }

    pub fn make_object(&self, _ctx: ContextId) -> RawHandle {
        self.alloc(SlotData::Object(ObjectData::default()))
    }

    pub fn make_date(&self, _ctx: ContextId, repr: &str) -> RawHandle {
        self.alloc(SlotData::Object(ObjectData {
            date_repr: Some(repr.to_owned()),
            ..Default::default()
        }))
    }

    pub fn make_native_fn(
        &self,
        _ctx: ContextId,
        f: impl Fn(&StubEngine, ContextId, Option<RawHandle>, &[RawHandle]) -> Result<RawHandle, EngineError>
            + Send
            + Sync
            + 'static,
    ) -> RawHandle {
        self.alloc(SlotData::Object(ObjectData {
            callable: Some(Callable::Native(Arc::new(f))),
            ..Default::default()
        }))
    }

    pub fn global_prop(&self, ctx: ContextId, name: &str) -> RawHandle {
        let global = self.global_object(ctx);
        self.get_property(ctx, global, name).unwrap_or(UNDEFINED)
    }

    pub fn is_alive(&self, handle: RawHandle) -> bool {
        self.state.lock().slots.contains_key(&handle.0)
    }

    pub fn protect_count(&self, handle: RawHandle) -> usize {
        self.state
            .lock()
            .slots
            .get(&handle.0)
            .map(|s| s.protect)
            .unwrap_or(0)
    }

    pub fn promise_settlement(&self, promise: RawHandle) -> Option<(bool, RawHandle)> {
        let state = self.state.lock();
        match state.slots.get(&promise.0) {
            Some(Slot {
                data: SlotData::Object(obj),
                ..
            }) => obj.promise.as_ref().and_then(|p| p.settled),
            _ => None,
        }
    }

    pub fn settle_attempts(&self, promise: RawHandle) -> u32 {
        let state = self.state.lock();
        match state.slots.get(&promise.0) {
            Some(Slot {
                data: SlotData::Object(obj),
                ..
            }) => obj.promise.as_ref().map(|p| p.attempts).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn live_group_count(&self) -> usize {
        self.state.lock().live_groups.len()
    }

    pub fn context_name(&self, ctx: ContextId) -> String {
        self.state
            .lock()
            .contexts
            .get(&ctx.0)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn alloc(&self, data: SlotData) -> RawHandle {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.slots.insert(id, Slot { data, protect: 0 });
        RawHandle(id)
    }

    fn with_object<R>(&self, handle: RawHandle, f: impl FnOnce(&ObjectData) -> R) -> Option<R> {
        let state = self.state.lock();
        match state.slots.get(&handle.0) {
            Some(Slot {
                data: SlotData::Object(obj),
                ..
            }) => Some(f(obj)),
            _ => None,
        }
    }

    fn with_object_mut<R>(
        &self,
        handle: RawHandle,
        f: impl FnOnce(&mut ObjectData) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        match state.slots.get_mut(&handle.0) {
            Some(Slot {
                data: SlotData::Object(obj),
                ..
            }) => Some(f(obj)),
            _ => None,
        }
    }

    /// Trap dispatch decision for a wrapper property access. `None` means
    /// "not a wrapper, handle as a plain object".
    fn wrapper_hooks(
        &self,
        handle: RawHandle,
        name: Option<&str>,
    ) -> Option<Option<(Arc<dyn WrapperHooks>, PrivateToken)>> {
        let (class, token) =
            self.with_object(handle, |obj| (obj.class, obj.private))
                .unwrap_or((None, None));
        let (class, token) = match (class, token) {
            (Some(class), Some(token)) => (class, token),
            _ => return None,
        };
        let stored = self.classes.lock().get(&class.0).cloned();
        let stored = match stored {
            Some(stored) => stored,
            None => return Some(None),
        };
        let consult = match name {
            // Unnamed access (enumeration, call) always consults the traps.
            None => true,
            Some(name) => {
                stored.statics.is_empty()
                    || stored.statics.iter().any(|s| s == name)
                    || RESERVED.contains(&name)
            }
        };
        if consult {
            Some(Some((stored.hooks.clone(), token)))
        } else {
            Some(None)
        }
    }

    fn resolve_call_target(&self, callee: RawHandle) -> Option<CallTarget> {
        let target = self.with_object(callee, |obj| match &obj.callable {
            Some(Callable::Native(f)) => Some(CallTarget::Native(f.clone())),
            Some(Callable::Settle { promise, resolved }) => Some(CallTarget::Settle {
                promise: *promise,
                resolved: *resolved,
            }),
            None => None,
        })??;
        Some(target)
    }

    fn settle(&self, promise: u64, resolved: bool, value: RawHandle) {
        let mut state = self.state.lock();
        if let Some(Slot {
            data: SlotData::Object(obj),
            ..
        }) = state.slots.get_mut(&promise)
        {
            if let Some(p) = obj.promise.as_mut() {
                p.attempts += 1;
                if p.settled.is_none() {
                    p.settled = Some((resolved, value));
                }
            }
        }
    }

    fn mark(state: &EngineState, id: u64, marked: &mut HashSet<u64>) {
        if !marked.insert(id) {
            return;
        }
        let Some(Slot {
            data: SlotData::Object(obj),
            ..
        }) = state.slots.get(&id)
        else {
            return;
        };
        for (handle, _) in obj.props.values() {
            Self::mark(state, handle.0, marked);
        }
        if let Some(elements) = &obj.elements {
            for handle in elements {
                Self::mark(state, handle.0, marked);
            }
        }
        if let Some(Callable::Settle { promise, .. }) = &obj.callable {
            Self::mark(state, *promise, marked);
        }
        if let Some(p) = &obj.promise {
            if let Some((_, value)) = p.settled {
                Self::mark(state, value.0, marked);
            }
        }
    }
}

impl EngineBackend for StubEngine {
    fn create_group(&self) -> GroupId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.live_groups.insert(id);
        GroupId(id)
    }

    fn release_group(&self, group: GroupId) {
        self.state.lock().live_groups.remove(&group.0);
    }

    fn create_context(&self, group: GroupId) -> ContextId {
        let global = self.make_object(ContextId(0));
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(&global.0) {
            slot.protect += 1;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.contexts.insert(
            id,
            CtxData {
                group,
                global,
                name: String::new(),
            },
        );
        ContextId(id)
    }

    fn destroy_context(&self, ctx: ContextId) {
        let mut state = self.state.lock();
        if let Some(data) = state.contexts.remove(&ctx.0) {
            let global = data.global;
            if let Some(slot) = state.slots.get_mut(&global.0) {
                slot.protect = slot.protect.saturating_sub(1);
            }
        }
    }

    fn context_group(&self, ctx: ContextId) -> GroupId {
        self.state
            .lock()
            .contexts
            .get(&ctx.0)
            .map(|c| c.group)
            .unwrap_or(GroupId(0))
    }

    fn global_object(&self, ctx: ContextId) -> RawHandle {
        self.state
            .lock()
            .contexts
            .get(&ctx.0)
            .map(|c| c.global)
            .unwrap_or(UNDEFINED)
    }

    fn set_context_name(&self, ctx: ContextId, name: &str) {
        if let Some(data) = self.state.lock().contexts.get_mut(&ctx.0) {
            data.name = name.to_owned();
        }
    }

    fn garbage_collect(&self, _ctx: ContextId) {
        let finalizers: Vec<(Arc<dyn WrapperHooks>, PrivateToken)> = {
            let mut state = self.state.lock();
            let mut marked = HashSet::new();
            let roots: Vec<u64> = state
                .slots
                .iter()
                .filter(|(_, slot)| slot.protect > 0)
                .map(|(id, _)| *id)
                .chain(state.contexts.values().map(|c| c.global.0))
                .collect();
            for root in roots {
                Self::mark(&state, root, &mut marked);
            }

            let dead: Vec<u64> = state
                .slots
                .keys()
                .filter(|id| !marked.contains(id))
                .copied()
                .collect();
            let mut finalizers = Vec::new();
            for id in &dead {
                if let Some(Slot {
                    data: SlotData::Object(obj),
                    ..
                }) = state.slots.get(id)
                {
                    if let (Some(class), Some(token)) = (obj.class, obj.private) {
                        if let Some(stored) = self.classes.lock().get(&class.0) {
                            finalizers.push((stored.hooks.clone(), token));
                        }
                    }
                }
                state.slots.remove(id);
            }
            state.weaks.retain(|_, slot| marked.contains(slot));
            finalizers
        };
        // Finalizers run outside the engine lock, like a real collector
        // calling back into the embedder.
        for (hooks, token) in finalizers {
            hooks.finalize(token);
        }
    }

    fn undefined(&self, _ctx: ContextId) -> RawHandle {
        UNDEFINED
    }

    fn null(&self, _ctx: ContextId) -> RawHandle {
        NULL
    }

    fn make_bool(&self, _ctx: ContextId, value: bool) -> RawHandle {
        self.alloc(SlotData::Bool(value))
    }

    fn make_number(&self, _ctx: ContextId, value: f64) -> RawHandle {
        self.alloc(SlotData::Number(value))
    }

    fn make_string(&self, _ctx: ContextId, value: &str) -> RawHandle {
        self.alloc(SlotData::String(value.to_owned()))
    }

    fn kind(&self, _ctx: ContextId, handle: RawHandle) -> HandleKind {
        match self.state.lock().slots.get(&handle.0).map(|s| &s.data) {
            Some(SlotData::Null) => HandleKind::Null,
            Some(SlotData::Bool(_)) => HandleKind::Bool,
            Some(SlotData::Number(_)) => HandleKind::Number,
            Some(SlotData::String(_)) => HandleKind::String,
            Some(SlotData::Object(_)) => HandleKind::Object,
            Some(SlotData::Undefined) | None => HandleKind::Undefined,
        }
    }

    fn as_bool(&self, _ctx: ContextId, handle: RawHandle) -> bool {
        matches!(
            self.state.lock().slots.get(&handle.0).map(|s| &s.data),
            Some(SlotData::Bool(true))
        )
    }

    fn as_number(&self, _ctx: ContextId, handle: RawHandle) -> f64 {
        match self.state.lock().slots.get(&handle.0).map(|s| &s.data) {
            Some(SlotData::Number(n)) => *n,
            _ => f64::NAN,
        }
    }

    fn copy_string(&self, _ctx: ContextId, handle: RawHandle) -> String {
        match self.state.lock().slots.get(&handle.0).map(|s| &s.data) {
            Some(SlotData::String(s)) => s.clone(),
            Some(SlotData::Number(n)) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Some(SlotData::Bool(b)) => b.to_string(),
            Some(SlotData::Null) => "null".into(),
            Some(SlotData::Object(obj)) => obj
                .date_repr
                .clone()
                .unwrap_or_else(|| "[object Object]".into()),
            Some(SlotData::Undefined) | None => "undefined".into(),
        }
    }

    fn is_array(&self, _ctx: ContextId, handle: RawHandle) -> bool {
        self.with_object(handle, |obj| obj.elements.is_some())
            .unwrap_or(false)
    }

    fn is_date(&self, _ctx: ContextId, handle: RawHandle) -> bool {
        self.with_object(handle, |obj| obj.date_repr.is_some())
            .unwrap_or(false)
    }

    fn is_function(&self, _ctx: ContextId, handle: RawHandle) -> bool {
        let (has_callable, class) = match self.with_object(handle, |obj| {
            (obj.callable.is_some(), obj.class)
        }) {
            Some(pair) => pair,
            None => return false,
        };
        if has_callable {
            return true;
        }
        match class {
            Some(class) => self
                .classes
                .lock()
                .get(&class.0)
                .map(|c| c.callable)
                .unwrap_or(false),
            None => false,
        }
    }

    fn make_array(&self, _ctx: ContextId, items: &[RawHandle]) -> RawHandle {
        self.alloc(SlotData::Object(ObjectData {
            elements: Some(items.to_vec()),
            ..Default::default()
        }))
    }

    fn get_property(
        &self,
        ctx: ContextId,
        object: RawHandle,
        name: &str,
    ) -> Result<RawHandle, EngineError> {
        match self.wrapper_hooks(object, Some(name)) {
            Some(Some((hooks, token))) => Ok(hooks.get(ctx, token, name).unwrap_or(UNDEFINED)),
            Some(None) => Ok(UNDEFINED),
            None => {
                let found = self.with_object(object, |obj| {
                    if name == "length" {
                        if let Some(elements) = &obj.elements {
                            return Some(Err(elements.len() as f64));
                        }
                    }
                    obj.props.get(name).map(|(handle, _)| Ok(*handle))
                });
                match found {
                    Some(Some(Ok(handle))) => Ok(handle),
                    Some(Some(Err(len))) => Ok(self.make_number(ctx, len)),
                    Some(None) => Ok(UNDEFINED),
                    None => Err(EngineError::exception("not an object")),
                }
            }
        }
    }

    fn set_property(
        &self,
        ctx: ContextId,
        object: RawHandle,
        name: &str,
        value: RawHandle,
        enumerable: bool,
    ) -> Result<(), EngineError> {
        match self.wrapper_hooks(object, Some(name)) {
            Some(Some((hooks, token))) => {
                hooks.set(ctx, token, name, value);
                Ok(())
            }
            Some(None) => Ok(()),
            None => self
                .with_object_mut(object, |obj| {
                    obj.props.insert(name.to_owned(), (value, enumerable));
                })
                .ok_or_else(|| EngineError::exception("not an object")),
        }
    }

    fn get_index(
        &self,
        ctx: ContextId,
        object: RawHandle,
        index: u32,
    ) -> Result<RawHandle, EngineError> {
        let name = index.to_string();
        match self.wrapper_hooks(object, Some(&name)) {
            Some(Some((hooks, token))) => Ok(hooks.get(ctx, token, &name).unwrap_or(UNDEFINED)),
            Some(None) => Ok(UNDEFINED),
            None => self
                .with_object(object, |obj| match &obj.elements {
                    Some(elements) => elements.get(index as usize).copied().unwrap_or(UNDEFINED),
                    None => obj
                        .props
                        .get(&name)
                        .map(|(handle, _)| *handle)
                        .unwrap_or(UNDEFINED),
                })
                .ok_or_else(|| EngineError::exception("not an object")),
        }
    }

    fn set_index(
        &self,
        ctx: ContextId,
        object: RawHandle,
        index: u32,
        value: RawHandle,
    ) -> Result<(), EngineError> {
        let name = index.to_string();
        match self.wrapper_hooks(object, Some(&name)) {
            Some(Some((hooks, token))) => {
                hooks.set(ctx, token, &name, value);
                Ok(())
            }
            Some(None) => Ok(()),
            None => self
                .with_object_mut(object, |obj| match &mut obj.elements {
                    Some(elements) => {
                        if index as usize >= elements.len() {
                            elements.resize(index as usize + 1, UNDEFINED);
                        }
                        elements[index as usize] = value;
                    }
                    None => {
                        obj.props.insert(name.clone(), (value, true));
                    }
                })
                .ok_or_else(|| EngineError::exception("not an object")),
        }
    }

    fn property_names(&self, ctx: ContextId, object: RawHandle) -> Vec<String> {
        match self.wrapper_hooks(object, None) {
            Some(Some((hooks, token))) => hooks.property_names(ctx, token),
            Some(None) => Vec::new(),
            None => self
                .with_object(object, |obj| match &obj.elements {
                    Some(elements) => (0..elements.len()).map(|i| i.to_string()).collect(),
                    None => obj
                        .props
                        .iter()
                        .filter(|(_, (_, enumerable))| *enumerable)
                        .map(|(name, _)| name.clone())
                        .collect(),
                })
                .unwrap_or_default(),
        }
    }

    fn call(
        &self,
        ctx: ContextId,
        callee: RawHandle,
        this: Option<RawHandle>,
        args: &[RawHandle],
    ) -> Result<RawHandle, EngineError> {
        if let Some(target) = self.resolve_call_target(callee) {
            return match target {
                CallTarget::Native(f) => f(self, ctx, this, args),
                CallTarget::Settle { promise, resolved } => {
                    let value = args.first().copied().unwrap_or(UNDEFINED);
                    self.settle(promise, resolved, value);
                    Ok(UNDEFINED)
                }
                CallTarget::Hooks(..) => unreachable!(),
            };
        }
        match self.wrapper_hooks(callee, None) {
            Some(Some((hooks, token))) => {
                hooks.call(ctx, token, this.unwrap_or(UNDEFINED), args)
            }
            _ => Err(EngineError::exception("not a function")),
        }
    }

    fn define_class(&self, spec: ClassSpec) -> ClassId {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        self.classes.lock().insert(
            id,
            Arc::new(StoredClass {
                statics: spec.static_properties,
                callable: spec.callable,
                hooks: spec.hooks,
            }),
        );
        ClassId(id)
    }

    fn make_wrapper(&self, _ctx: ContextId, class: ClassId, private: PrivateToken) -> RawHandle {
        self.alloc(SlotData::Object(ObjectData {
            class: Some(class),
            private: Some(private),
            ..Default::default()
        }))
    }

    fn wrapper_private(&self, _ctx: ContextId, handle: RawHandle) -> Option<PrivateToken> {
        self.with_object(handle, |obj| obj.private).flatten()
    }

    fn protect(&self, _ctx: ContextId, handle: RawHandle) {
        if let Some(slot) = self.state.lock().slots.get_mut(&handle.0) {
            slot.protect += 1;
        }
    }

    fn unprotect(&self, _ctx: ContextId, handle: RawHandle) {
        if let Some(slot) = self.state.lock().slots.get_mut(&handle.0) {
            slot.protect = slot.protect.saturating_sub(1);
        }
    }

    fn make_weak(&self, _ctx: ContextId, handle: RawHandle) -> WeakHandle {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.weaks.insert(id, handle.0);
        WeakHandle(id)
    }

    fn weak_target(&self, group: GroupId, weak: WeakHandle) -> Option<RawHandle> {
        let state = self.state.lock();
        if !state.live_groups.contains(&group.0) {
            return None;
        }
        let slot = state.weaks.get(&weak.0)?;
        state.slots.contains_key(slot).then_some(RawHandle(*slot))
    }

    fn release_weak(&self, _group: GroupId, weak: WeakHandle) {
        self.state.lock().weaks.remove(&weak.0);
    }

    fn make_promise(&self, _ctx: ContextId) -> Result<PromiseCapability, EngineError> {
        let promise = self.alloc(SlotData::Object(ObjectData {
            promise: Some(PromiseState {
                settled: None,
                attempts: 0,
            }),
            ..Default::default()
        }));
        let resolve = self.alloc(SlotData::Object(ObjectData {
            callable: Some(Callable::Settle {
                promise: promise.0,
                resolved: true,
            }),
            ..Default::default()
        }));
        let reject = self.alloc(SlotData::Object(ObjectData {
            callable: Some(Callable::Settle {
                promise: promise.0,
                resolved: false,
            }),
            ..Default::default()
        }));
        Ok(PromiseCapability {
            promise,
            resolve,
            reject,
        })
    }

    fn evaluate(
        &self,
        ctx: ContextId,
        source: &str,
        source_name: &str,
    ) -> Result<RawHandle, EngineError> {
        let handler = self.eval.lock().clone();
        match handler {
            Some(handler) => handler(self, ctx, source, source_name),
            None => Err(EngineError::exception("no evaluator installed")),
        }
    }
}
