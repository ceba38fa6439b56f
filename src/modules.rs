//! CommonJS-style module loading.
//!
//! Resolution probes each configured search directory, appending the
//! default extension when the request lacks it. A module evaluates at most
//! once per context; its exports object is rooted in the context's module
//! cache so later `require`s share the same instance. Failed loads are not
//! cached, so a later `require` retries from scratch.

use std::any::Any;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tracing::{error, info, warn};

use crate::context::BridgeShared;
use crate::convert;
use crate::host::HostFunction;
use crate::roots::{ContextPrivate, Protected};
use crate::value::Value;
use crate::{BridgeError, BridgeResult};

/// Module resolution settings, per runtime.
#[derive(Clone, Debug)]
pub struct ModuleOptions {
    /// Probed in order; relative directories resolve against the process
    /// working directory.
    pub search_dirs: Vec<PathBuf>,
    /// Appended to requests that do not already end in it.
    pub extension: String,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        ModuleOptions {
            search_dirs: vec![PathBuf::from("."), PathBuf::from("modules")],
            extension: "js".into(),
        }
    }
}

/// First existing candidate path for `name`, or `None`.
pub(crate) fn resolve_module(options: &ModuleOptions, name: &str) -> Option<PathBuf> {
    let bare = name.strip_prefix("./").unwrap_or(name);
    let suffix = format!(".{}", options.extension);
    for dir in &options.search_dirs {
        let mut path = dir.join(bare);
        if !path.to_string_lossy().ends_with(&suffix) {
            let mut os = path.into_os_string();
            os.push(&suffix);
            path = PathBuf::from(os);
        }
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

/// Scopes the module body and collects its exports. `this` is undefined
/// inside the body, like any strict module scope.
fn wrap_module_source(source: &str) -> String {
    format!(
        "(function(){{ let module = {{}}; module.exports = {{}};\n\
         (function(module, exports){{\n{source}\n}}).call(undefined, module, module.exports);\n\
         return module; }})()"
    )
}

/// Per-context loader behind the script-visible `require`. Holds its
/// context weakly so a cached `require` closure cannot keep a torn-down
/// context alive.
pub(crate) struct ModuleLoader {
    shared: Weak<BridgeShared>,
    private: Weak<ContextPrivate>,
    options: ModuleOptions,
}

impl ModuleLoader {
    pub fn new(
        shared: &Arc<BridgeShared>,
        private: &Arc<ContextPrivate>,
        options: ModuleOptions,
    ) -> ModuleLoader {
        ModuleLoader {
            shared: Arc::downgrade(shared),
            private: Arc::downgrade(private),
            options,
        }
    }

    /// Script-facing entry: failures are logged and come back as empty,
    /// they never abort the requiring script.
    pub fn require(&self, name: &str) -> Value {
        match self.load(name) {
            Ok(value) => value,
            Err(e) => {
                error!("require(\"{name}\") failed: {e}");
                Value::Empty
            }
        }
    }

    fn load(&self, name: &str) -> BridgeResult<Value> {
        let shared = self.shared.upgrade().ok_or(BridgeError::ContextLost)?;
        let private = self.private.upgrade().ok_or(BridgeError::ContextLost)?;
        let ctx = private.ctx();

        let path = resolve_module(&self.options, name)
            .ok_or_else(|| BridgeError::ModuleNotFound(name.to_owned()))?;
        if let Some(exports) = private.find_module(&path) {
            return convert::to_host(&shared, ctx, exports);
        }

        info!("loading module {}", path.display());
        let source = fs::read_to_string(&path)?;
        let wrapped = wrap_module_source(&source);
        let module_obj = shared
            .backend
            .evaluate(ctx, &wrapped, &path.to_string_lossy())
            .map_err(|e| BridgeError::Script(e.message))?;
        let exports = shared
            .backend
            .get_property(ctx, module_obj, "exports")
            .map_err(|e| BridgeError::Script(e.message))?;

        let rooted = Protected::root(&private, exports).ok_or(BridgeError::ContextLost)?;
        private.add_module(path, rooted);
        convert::to_host(&shared, ctx, exports)
    }
}

/// The `require` global.
pub(crate) struct RequireFn {
    pub loader: Arc<ModuleLoader>,
}

impl HostFunction for RequireFn {
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>> {
        let Some(name) = args.first().and_then(Value::as_str) else {
            warn!("require called without a module name");
            return Err(BridgeError::InvalidArgument("module name".into()));
        };
        Ok(Some(self.loader.require(name)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
