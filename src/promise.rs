//! Bridging host promise-like objects to native engine promises.
//!
//! The host object is subscribed through its `then` with two bridged
//! continuations. The continuations do not settle the native promise on
//! the caller's thread; they re-post themselves onto the dispatch queue,
//! so settlement always happens during a `pump` on the engine thread, no
//! matter which thread completed the host promise.

use std::any::Any;
use std::sync::Arc;

use tracing::error;

use crate::context::BridgeShared;
use crate::engine::{ContextId, RawHandle};
use crate::host::{FunctionRef, HostFunction};
use crate::proxy::EngineFunctionProxy;
use crate::sched::{log_dispatch_error, Scheduler};
use crate::value::Value;
use crate::{BridgeError, BridgeResult};

/// Defers a host-side continuation onto the dispatch queue. The immediate
/// `send` only enqueues and always succeeds; the wrapped function runs on
/// the next pump.
struct QueuedCallback {
    scheduler: Scheduler,
    inner: FunctionRef,
}

impl HostFunction for QueuedCallback {
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>> {
        let inner = self.inner.clone();
        let args = args.to_vec();
        self.scheduler.post(move || {
            if let Err(e) = inner.send(&args) {
                log_dispatch_error("promise continuation", e);
            }
        });
        Ok(None)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates a native promise settled by the host object's own `then`.
/// Subscription failures are logged and reported as `null`, never as an
/// exception; a broken promise-like object must not break the conversion
/// it rode in on.
pub(crate) fn bridge_promise(
    shared: &Arc<BridgeShared>,
    ctx: ContextId,
    obj: &crate::host::ObjectRef,
) -> BridgeResult<RawHandle> {
    let backend = &shared.backend;
    let capability = backend
        .make_promise(ctx)
        .map_err(|e| BridgeError::Script(e.message))?;
    let private = shared
        .context_private(ctx)
        .ok_or(BridgeError::ContextLost)?;

    let resolve: FunctionRef = Arc::new(QueuedCallback {
        scheduler: shared.scheduler.clone(),
        inner: Arc::new(EngineFunctionProxy::root(
            shared,
            &private,
            capability.resolve,
            None,
        )?),
    });
    let reject: FunctionRef = Arc::new(QueuedCallback {
        scheduler: shared.scheduler.clone(),
        inner: Arc::new(EngineFunctionProxy::root(
            shared,
            &private,
            capability.reject,
            None,
        )?),
    });

    let then = match obj.get("then") {
        Ok(Value::Function(then)) => then,
        Ok(_) => {
            error!("promise-like object has no callable then");
            return Ok(backend.null(ctx));
        }
        Err(e) => {
            error!("promise-like object refused its then: {e}");
            return Ok(backend.null(ctx));
        }
    };
    if let Err(e) = then.send(&[Value::Function(resolve), Value::Function(reject)]) {
        error!("promise subscription failed: {e}");
        return Ok(backend.null(ctx));
    }
    Ok(capability.promise)
}
