//! crossrt is a bridge between a reference-counted host object model and an
//! embedded, garbage-collected script engine.
//!
//! The crate joins two ownership disciplines that do not understand each
//! other. Host objects are shared `Arc` values with deterministic drop;
//! engine values live in a collector-managed heap and die whenever the
//! collector decides, possibly inside a finalizer callback where almost
//! nothing is safe to do. The building blocks:
//!
//! * [`Value`]: the host-neutral tagged value that crosses the boundary.
//! * [`HostObject`] / [`HostFunction`]: capability traits the host side
//!   implements; the bridge consumes them, it never reflects beyond them.
//! * [`EngineBackend`]: the narrow embedding contract an engine must
//!   provide (opaque handles, trap tables, protect/unprotect, weak refs).
//! * [`ScriptRuntime`] / [`ScriptContext`]: the embedder surface,
//!   `create_context`, `run_script`, `run_file`, and a `pump()` that drains
//!   deferred work and fires timers on the engine thread.
//!
//! Every reference crossing from the host side into the engine heap is
//! either reachable from an engine-visible container (ordinary GC) or
//! registered in the per-context rooting ledger and explicitly unrooted.
//! Releases triggered from finalizers or foreign threads are never executed
//! in place; they are posted to the dispatch queue and drained by `pump()`.

pub mod context;
pub mod engine;
pub mod host;
pub mod modules;
pub mod sched;
pub mod value;

mod convert;
mod promise;
mod proxy;
mod roots;
mod wrapper;

use thiserror::Error;

pub use context::{BridgeOptions, ScriptContext, ScriptRuntime};
pub use engine::{
    ClassSpec, ContextId, EngineBackend, EngineError, GroupId, HandleKind, PrivateToken,
    PromiseCapability, RawHandle, WeakHandle, WrapperHooks,
};
pub use host::{
    ArrayObject, ClassDescriptor, FunctionRef, HostFunction, HostObject, MapObject, ObjectRef,
};
pub use modules::ModuleOptions;
pub use proxy::{EngineFunctionProxy, EngineObjectProxy};
pub use sched::Scheduler;
pub use value::Value;

/// Result type used across the bridge.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Errors produced while moving values and calls across the runtime boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// A script-side exception, already reduced to its message.
    #[error("script exception: {0}")]
    Script(String),
    /// A value could not be represented on the other side of the boundary.
    #[error("conversion failed: {0}")]
    Conversion(String),
    /// A host dispatch failed; the original host error code is not carried.
    #[error("native call failed")]
    NativeCall,
    /// The execution context the handle belonged to has been torn down.
    #[error("script context is gone")]
    ContextLost,
    /// The host object does not expose the requested property.
    #[error("property not found: {0}")]
    PropertyNotFound(String),
    /// A caller handed the bridge something it cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Module resolution walked every search directory without a hit.
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// File system failure while loading a module or script.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::Script(err.message)
    }
}
