//! The embedding contract the bridge consumes from a script engine.
//!
//! Everything the bridge knows about the engine fits in [`EngineBackend`]:
//! opaque value handles tied to an execution context, a class/trap-table
//! mechanism with an attached private token, protect/unprotect rooting,
//! weak references, promise capabilities, and source evaluation. The
//! engine's GC, bytecode, and language semantics stay on its side of the
//! trait.
//!
//! Threading: every method except those reached from [`WrapperHooks`]
//! callbacks must be invoked on the engine's owning thread. The bridge
//! upholds this by funnelling cross-thread work through its dispatch
//! queue.

use std::sync::Arc;

use thiserror::Error;

/// Opaque handle into the engine heap. Only meaningful together with the
/// context (or context group) it was created in; invalid once that context
/// is torn down or the collector reclaims it while unrooted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Weak reference to an engine object; resolves to `None` after collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WeakHandle(pub u64);

/// An execution realm inside a context group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// A set of contexts that may share values, identity caches, and weak
/// references. Reference-counted independently of its contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

/// Engine-side class definition produced by [`EngineBackend::define_class`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(pub u64);

/// Opaque private token the bridge attaches to wrapper objects; handed
/// back verbatim on every trap and on finalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrivateToken(pub u64);

/// Coarse type of an engine value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Undefined,
    Null,
    Bool,
    Number,
    String,
    Object,
}

/// A script exception reduced to its message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn exception(message: impl Into<String>) -> Self {
        EngineError {
            message: message.into(),
        }
    }
}

/// Native promise plus its resolve/reject continuations, all engine
/// function objects.
#[derive(Clone, Copy, Debug)]
pub struct PromiseCapability {
    pub promise: RawHandle,
    pub resolve: RawHandle,
    pub reject: RawHandle,
}

/// Trap table the engine calls back into when scripts touch a wrapper
/// object created through [`EngineBackend::make_wrapper`].
///
/// The `finalize` trap runs inside the engine's collector and must only
/// enqueue work; the bridge's implementation posts the actual release to
/// its dispatch queue.
pub trait WrapperHooks: Send + Sync {
    /// `None` means "no such property", which the engine sees as `undefined`.
    fn get(&self, _ctx: ContextId, _token: PrivateToken, _name: &str) -> Option<RawHandle> {
        None
    }

    /// Writes are tolerant: a `false` return is advisory, never an
    /// exception.
    fn set(&self, _ctx: ContextId, _token: PrivateToken, _name: &str, _value: RawHandle) -> bool {
        false
    }

    fn property_names(&self, _ctx: ContextId, _token: PrivateToken) -> Vec<String> {
        Vec::new()
    }

    /// Call trap for callable classes; an `Err` becomes a script-visible
    /// exception.
    fn call(
        &self,
        _ctx: ContextId,
        _token: PrivateToken,
        _this: RawHandle,
        _args: &[RawHandle],
    ) -> Result<RawHandle, EngineError> {
        Err(EngineError::exception("not callable"))
    }

    /// String conversion hint used by the engine's `toString` machinery.
    fn to_string_hint(&self, _ctx: ContextId, _token: PrivateToken) -> Option<String> {
        None
    }

    fn finalize(&self, token: PrivateToken);
}

/// Class definition registered with the engine. An empty
/// `static_properties` list means every access goes through the generic
/// get/set traps; a non-empty list builds a static accessor table whose
/// entries all dispatch into the same traps.
pub struct ClassSpec {
    pub name: String,
    pub static_properties: Vec<String>,
    pub callable: bool,
    pub hooks: Arc<dyn WrapperHooks>,
}

/// The full embedding surface. Implementations wrap a concrete engine's
/// C API (or, in tests, an in-memory fake) behind opaque ids.
pub trait EngineBackend: Send + Sync {
    // Groups and contexts.
    fn create_group(&self) -> GroupId;
    fn release_group(&self, group: GroupId);
    fn create_context(&self, group: GroupId) -> ContextId;
    fn destroy_context(&self, ctx: ContextId);
    fn context_group(&self, ctx: ContextId) -> GroupId;
    fn global_object(&self, ctx: ContextId) -> RawHandle;
    /// Diagnostic label shown in engine tooling; best effort.
    fn set_context_name(&self, ctx: ContextId, name: &str);
    /// Synchronous on-demand collection; used at context teardown only.
    fn garbage_collect(&self, ctx: ContextId);

    // Primitive values.
    fn undefined(&self, ctx: ContextId) -> RawHandle;
    fn null(&self, ctx: ContextId) -> RawHandle;
    fn make_bool(&self, ctx: ContextId, value: bool) -> RawHandle;
    fn make_number(&self, ctx: ContextId, value: f64) -> RawHandle;
    fn make_string(&self, ctx: ContextId, value: &str) -> RawHandle;

    // Inspection.
    fn kind(&self, ctx: ContextId, handle: RawHandle) -> HandleKind;
    fn as_bool(&self, ctx: ContextId, handle: RawHandle) -> bool;
    fn as_number(&self, ctx: ContextId, handle: RawHandle) -> f64;
    /// UTF-8 copy of the value's string form (also used for dates).
    fn copy_string(&self, ctx: ContextId, handle: RawHandle) -> String;
    fn is_array(&self, ctx: ContextId, handle: RawHandle) -> bool;
    fn is_date(&self, ctx: ContextId, handle: RawHandle) -> bool;
    fn is_function(&self, ctx: ContextId, handle: RawHandle) -> bool;

    // Objects.
    fn make_array(&self, ctx: ContextId, items: &[RawHandle]) -> RawHandle;
    fn get_property(
        &self,
        ctx: ContextId,
        object: RawHandle,
        name: &str,
    ) -> Result<RawHandle, EngineError>;
    fn set_property(
        &self,
        ctx: ContextId,
        object: RawHandle,
        name: &str,
        value: RawHandle,
        enumerable: bool,
    ) -> Result<(), EngineError>;
    fn get_index(
        &self,
        ctx: ContextId,
        object: RawHandle,
        index: u32,
    ) -> Result<RawHandle, EngineError>;
    fn set_index(
        &self,
        ctx: ContextId,
        object: RawHandle,
        index: u32,
        value: RawHandle,
    ) -> Result<(), EngineError>;
    fn property_names(&self, ctx: ContextId, object: RawHandle) -> Vec<String>;
    fn call(
        &self,
        ctx: ContextId,
        callee: RawHandle,
        this: Option<RawHandle>,
        args: &[RawHandle],
    ) -> Result<RawHandle, EngineError>;

    // Wrapper support.
    fn define_class(&self, spec: ClassSpec) -> ClassId;
    fn make_wrapper(&self, ctx: ContextId, class: ClassId, private: PrivateToken) -> RawHandle;
    /// Private token of a wrapper object, if `handle` is one.
    fn wrapper_private(&self, ctx: ContextId, handle: RawHandle) -> Option<PrivateToken>;

    // Rooting and weak references.
    fn protect(&self, ctx: ContextId, handle: RawHandle);
    fn unprotect(&self, ctx: ContextId, handle: RawHandle);
    fn make_weak(&self, ctx: ContextId, handle: RawHandle) -> WeakHandle;
    fn weak_target(&self, group: GroupId, weak: WeakHandle) -> Option<RawHandle>;
    fn release_weak(&self, group: GroupId, weak: WeakHandle);

    // Promises and evaluation.
    fn make_promise(&self, ctx: ContextId) -> Result<PromiseCapability, EngineError>;
    fn evaluate(
        &self,
        ctx: ContextId,
        source: &str,
        source_name: &str,
    ) -> Result<RawHandle, EngineError>;
}
