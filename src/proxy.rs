//! Host-side proxies over engine objects and functions.
//!
//! A proxy owns a rooted handle through the context's ledger, so the
//! engine cannot collect the target while the host still references it.
//! After context teardown the root is gone; every operation then fails
//! soft with [`BridgeError::ContextLost`] instead of touching a dead
//! context.

use std::any::Any;
use std::sync::Arc;

use tracing::warn;

use crate::context::BridgeShared;
use crate::convert;
use crate::engine::{ContextId, RawHandle};
use crate::host::{ArrayObject, HostFunction, HostObject};
use crate::roots::{ContextPrivate, Protected};
use crate::value::Value;
use crate::{BridgeError, BridgeResult};

/// Script object held by the host. Compared by reference identity like any
/// other host object.
pub struct EngineObjectProxy {
    shared: Arc<BridgeShared>,
    protected: Protected,
    is_array: bool,
}

impl EngineObjectProxy {
    pub(crate) fn root(
        shared: &Arc<BridgeShared>,
        owner: &Arc<ContextPrivate>,
        handle: RawHandle,
        is_array: bool,
    ) -> BridgeResult<EngineObjectProxy> {
        let protected = Protected::root(owner, handle).ok_or(BridgeError::ContextLost)?;
        Ok(EngineObjectProxy {
            shared: shared.clone(),
            protected,
            is_array,
        })
    }

    pub(crate) fn engine_handle(&self) -> Option<RawHandle> {
        self.protected.handle()
    }

    pub(crate) fn ctx(&self) -> ContextId {
        self.protected.ctx()
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    fn live_handle(&self) -> BridgeResult<RawHandle> {
        match self.protected.handle() {
            Some(handle) if !self.protected.owner().is_torn_down() => Ok(handle),
            _ => {
                warn!("script object used after its context was torn down");
                Err(BridgeError::ContextLost)
            }
        }
    }
}

impl HostObject for EngineObjectProxy {
    fn get(&self, name: &str) -> BridgeResult<Value> {
        let handle = self.live_handle()?;
        if name == "description" {
            return Err(BridgeError::PropertyNotFound(name.to_owned()));
        }
        if self.is_array && name != "length" {
            return Err(BridgeError::PropertyNotFound(name.to_owned()));
        }
        let ctx = self.ctx();
        let backend = &self.shared.backend;
        if name == "allKeys" {
            let names = backend
                .property_names(ctx, handle)
                .into_iter()
                .map(Value::from)
                .collect();
            return Ok(Value::Object(Arc::new(ArrayObject::from_values(names))));
        }
        let result = backend
            .get_property(ctx, handle, name)
            .map_err(|e| BridgeError::Script(e.message))?;
        // A method fetched off a script object stays bound to it.
        if !self.is_array && backend.is_function(ctx, result) {
            let proxy =
                EngineFunctionProxy::root(&self.shared, self.protected.owner(), result, Some(handle))?;
            return Ok(Value::Function(Arc::new(proxy)));
        }
        convert::to_host(&self.shared, ctx, result)
    }

    fn get_index(&self, index: u32) -> BridgeResult<Value> {
        let handle = self.live_handle()?;
        let ctx = self.ctx();
        let result = self
            .shared
            .backend
            .get_index(ctx, handle, index)
            .map_err(|e| BridgeError::Script(e.message))?;
        convert::to_host(&self.shared, ctx, result)
    }

    fn set(&self, name: &str, value: Value) -> BridgeResult<()> {
        let handle = self.live_handle()?;
        if self.is_array {
            return Err(BridgeError::PropertyNotFound(name.to_owned()));
        }
        let ctx = self.ctx();
        let converted = convert::to_engine(&self.shared, ctx, &value)?;
        self.shared
            .backend
            .set_property(ctx, handle, name, converted, true)
            .map_err(|e| BridgeError::Script(e.message))
    }

    fn set_index(&self, index: u32, value: Value) -> BridgeResult<()> {
        let handle = self.live_handle()?;
        let ctx = self.ctx();
        let converted = convert::to_engine(&self.shared, ctx, &value)?;
        self.shared
            .backend
            .set_index(ctx, handle, index, converted)
            .map_err(|e| BridgeError::Script(e.message))
    }

    fn keys(&self) -> Option<Vec<String>> {
        let handle = self.live_handle().ok()?;
        Some(self.shared.backend.property_names(self.ctx(), handle))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Script function held by the host. Optionally carries the object it was
/// fetched from, which becomes `this` on every call.
pub struct EngineFunctionProxy {
    shared: Arc<BridgeShared>,
    protected: Protected,
    this: Option<RawHandle>,
}

impl EngineFunctionProxy {
    pub(crate) fn root(
        shared: &Arc<BridgeShared>,
        owner: &Arc<ContextPrivate>,
        handle: RawHandle,
        this: Option<RawHandle>,
    ) -> BridgeResult<EngineFunctionProxy> {
        let protected = Protected::root(owner, handle).ok_or(BridgeError::ContextLost)?;
        Ok(EngineFunctionProxy {
            shared: shared.clone(),
            protected,
            this,
        })
    }

    pub(crate) fn engine_handle(&self) -> Option<RawHandle> {
        self.protected.handle()
    }

    pub(crate) fn ctx(&self) -> ContextId {
        self.protected.ctx()
    }
}

impl HostFunction for EngineFunctionProxy {
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>> {
        let handle = match self.protected.handle() {
            Some(handle) if !self.protected.owner().is_torn_down() => handle,
            _ => {
                warn!("script function called after its context was torn down");
                return Err(BridgeError::ContextLost);
            }
        };
        let ctx = self.ctx();
        let converted: BridgeResult<Vec<RawHandle>> = args
            .iter()
            .map(|arg| convert::to_engine(&self.shared, ctx, arg))
            .collect();
        let result = self
            .shared
            .backend
            .call(ctx, handle, self.this, &converted?)
            .map_err(|e| {
                warn!("script call failed: {}", e.message);
                BridgeError::Script(e.message)
            })?;
        Ok(Some(convert::to_host(&self.shared, ctx, result)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
