//! Bidirectional value conversion between [`Value`] and engine handles.
//!
//! Primitives convert structurally. Objects and functions are never copied:
//! host objects cross as identity-cached wrappers, engine objects cross as
//! rooted proxies, and a proxy converting back toward the engine hands out
//! its original handle when the target context belongs to the same group,
//! so no proxy-of-proxy chains form.

use std::sync::Arc;

use crate::context::BridgeShared;
use crate::engine::{ContextId, HandleKind, RawHandle};
use crate::proxy::{EngineFunctionProxy, EngineObjectProxy};
use crate::value::Value;
use crate::wrapper;
use crate::{BridgeError, BridgeResult};

pub(crate) fn to_engine(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    value: &Value,
) -> BridgeResult<RawHandle> {
    let backend = &shared.backend;
    match value {
        Value::Empty => Ok(backend.null(ctx)),
        Value::Bool(b) => Ok(backend.make_bool(ctx, *b)),
        Value::Number(n) => Ok(backend.make_number(ctx, *n)),
        Value::String(s) => Ok(backend.make_string(ctx, s)),
        Value::Object(obj) => {
            if let Some(proxy) = obj.as_any().downcast_ref::<EngineObjectProxy>() {
                if let Some(handle) = proxy.engine_handle() {
                    if backend.context_group(proxy.ctx()) == backend.context_group(ctx) {
                        return Ok(handle);
                    }
                }
            }
            wrapper::wrap_object(shared, ctx, obj)
        }
        Value::Function(func) => {
            if let Some(proxy) = func.as_any().downcast_ref::<EngineFunctionProxy>() {
                if let Some(handle) = proxy.engine_handle() {
                    if backend.context_group(proxy.ctx()) == backend.context_group(ctx) {
                        return Ok(handle);
                    }
                }
            }
            wrapper::wrap_function(shared, ctx, func)
        }
    }
}

pub(crate) fn to_host(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    handle: RawHandle,
) -> BridgeResult<Value> {
    let backend = &shared.backend;
    match backend.kind(ctx, handle) {
        HandleKind::Undefined | HandleKind::Null => Ok(Value::Empty),
        HandleKind::Bool => Ok(Value::Bool(backend.as_bool(ctx, handle))),
        HandleKind::Number => Ok(Value::Number(backend.as_number(ctx, handle))),
        HandleKind::String => Ok(Value::String(backend.copy_string(ctx, handle))),
        HandleKind::Object => {
            // Dates cross as their string form; there is no host-side date.
            if backend.is_date(ctx, handle) {
                return Ok(Value::String(backend.copy_string(ctx, handle)));
            }
            // Unwrap our own wrappers back to the host reference they
            // carry instead of proxying a proxy.
            if let Some(token) = backend.wrapper_private(ctx, handle) {
                if let Some(value) = shared.wrapper_value(token) {
                    return Ok(value);
                }
                return Err(BridgeError::Conversion(
                    "wrapper private state already finalized".into(),
                ));
            }
            let private = shared
                .context_private(ctx)
                .ok_or(BridgeError::ContextLost)?;
            if backend.is_function(ctx, handle) {
                let proxy = EngineFunctionProxy::root(shared, &private, handle, None)?;
                return Ok(Value::Function(Arc::new(proxy)));
            }
            let is_array = backend.is_array(ctx, handle);
            let proxy = EngineObjectProxy::root(shared, &private, handle, is_array)?;
            Ok(Value::Object(Arc::new(proxy)))
        }
    }
}
