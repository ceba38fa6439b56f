//! Host-side capability contract consumed by the bridge.
//!
//! The bridge never reflects over host objects beyond what these traits
//! expose: named/indexed get and set, optional key enumeration, an optional
//! class descriptor used to build static property tables on the engine
//! side, and a plain `send` for functions.

use std::any::Any;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::value::Value;
use crate::{BridgeError, BridgeResult};

/// Shared reference to a host object. Every holder shares ownership; the
/// bridge's caches only ever hold it weakly (by identity, not by `Arc`).
pub type ObjectRef = Arc<dyn HostObject>;

/// Shared reference to a host function.
pub type FunctionRef = Arc<dyn HostFunction>;

/// A reference-counted component-model object outside the engine heap.
pub trait HostObject: Send + Sync {
    fn get(&self, name: &str) -> BridgeResult<Value>;

    fn get_index(&self, _index: u32) -> BridgeResult<Value> {
        Err(BridgeError::PropertyNotFound("<index>".into()))
    }

    fn set(&self, name: &str, _value: Value) -> BridgeResult<()> {
        Err(BridgeError::PropertyNotFound(name.to_owned()))
    }

    fn set_index(&self, _index: u32, _value: Value) -> BridgeResult<()> {
        Err(BridgeError::PropertyNotFound("<index>".into()))
    }

    /// Ordered key enumeration, if the object supports it. Objects without
    /// it may still be enumerable through a numeric `length` property.
    fn keys(&self) -> Option<Vec<String>> {
        None
    }

    /// Class/method descriptor used for static property table generation.
    fn descriptor(&self) -> Option<Arc<ClassDescriptor>> {
        None
    }

    /// Human-readable description, surfaced to scripts via `toString`.
    fn description(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// A reference-counted component-model function.
pub trait HostFunction: Send + Sync {
    /// Dispatch with positional arguments; `None` means "no return value".
    fn send(&self, args: &[Value]) -> BridgeResult<Option<Value>>;

    fn as_any(&self) -> &dyn Any;
}

/// Identity key for a host object: the address of its shared allocation.
/// Two `ObjectRef` clones of the same object produce the same key.
pub(crate) fn object_identity(obj: &ObjectRef) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

pub(crate) fn descriptor_identity(desc: &Arc<ClassDescriptor>) -> usize {
    Arc::as_ptr(desc) as *const () as usize
}

/// Class name every promise-like host object carries in its descriptor
/// chain head. Such objects are routed through the promise bridge and are
/// never wrapped generically.
pub const PROMISE_CLASS_NAME: &str = "Promise";

/// Static reflection data describing a host class: its property and method
/// names plus the parent chain. Descriptors are compared by identity, so a
/// class should hand out one shared `Arc` for its lifetime.
#[derive(Debug, Default)]
pub struct ClassDescriptor {
    pub class_name: String,
    /// Array-like classes cross into the engine as true arrays, built
    /// element by element from `length`/`get_index`.
    pub array_like: bool,
    /// Dynamic classes skip static table generation and take every
    /// property access through the generic get/set traps.
    pub dynamic: bool,
    pub properties: Vec<String>,
    pub methods: Vec<String>,
    pub parent: Option<Arc<ClassDescriptor>>,
}

impl ClassDescriptor {
    pub fn named(class_name: &str) -> Self {
        ClassDescriptor {
            class_name: class_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn is_promise_like(&self) -> bool {
        self.class_name == PROMISE_CLASS_NAME
    }

    /// Walks the inheritance chain and flattens it into one ordered name
    /// list: properties first, then methods, first occurrence wins. The
    /// `allKeys` pseudo-property never makes it into a static table.
    pub fn flatten(self: &Arc<Self>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if name != "allKeys" && !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        };

        let mut cursor = Some(self.clone());
        while let Some(desc) = cursor {
            for p in &desc.properties {
                push(p);
            }
            cursor = desc.parent.clone();
        }
        let mut cursor = Some(self.clone());
        while let Some(desc) = cursor {
            for m in &desc.methods {
                push(m);
            }
            cursor = desc.parent.clone();
        }
        names
    }
}

pub(crate) fn is_promise_like(obj: &ObjectRef) -> bool {
    obj.descriptor().is_some_and(|d| d.is_promise_like())
}

static ARRAY_DESCRIPTOR: Lazy<Arc<ClassDescriptor>> = Lazy::new(|| {
    Arc::new(ClassDescriptor {
        class_name: "Array".into(),
        array_like: true,
        dynamic: true,
        ..Default::default()
    })
});

static MAP_DESCRIPTOR: Lazy<Arc<ClassDescriptor>> = Lazy::new(|| {
    Arc::new(ClassDescriptor {
        class_name: "Map".into(),
        dynamic: true,
        ..Default::default()
    })
});

/// Index-addressed host container. Enumerable through `length`, which is
/// also how it crosses into the engine as a native array.
#[derive(Default)]
pub struct ArrayObject {
    items: Mutex<Vec<Value>>,
}

impl ArrayObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        ArrayObject {
            items: Mutex::new(items),
        }
    }

    pub fn push(&self, value: Value) {
        self.items.lock().push(value);
    }

    pub fn len(&self) -> u32 {
        self.items.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl HostObject for ArrayObject {
    fn get(&self, name: &str) -> BridgeResult<Value> {
        match name {
            "length" => Ok(Value::from(self.len())),
            _ => Err(BridgeError::PropertyNotFound(name.to_owned())),
        }
    }

    fn get_index(&self, index: u32) -> BridgeResult<Value> {
        self.items
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| BridgeError::PropertyNotFound(index.to_string()))
    }

    fn set_index(&self, index: u32, value: Value) -> BridgeResult<()> {
        let mut items = self.items.lock();
        let index = index as usize;
        if index >= items.len() {
            items.resize_with(index + 1, Value::default);
        }
        items[index] = value;
        Ok(())
    }

    fn descriptor(&self) -> Option<Arc<ClassDescriptor>> {
        Some(ARRAY_DESCRIPTOR.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Insertion-ordered string-keyed host container; enumeration order is the
/// order keys were first written.
#[derive(Default)]
pub struct MapObject {
    entries: Mutex<IndexMap<String, Value>>,
}

impl MapObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, value: Value) {
        self.entries.lock().insert(name.to_owned(), value);
    }
}

impl HostObject for MapObject {
    fn get(&self, name: &str) -> BridgeResult<Value> {
        self.entries
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::PropertyNotFound(name.to_owned()))
    }

    fn set(&self, name: &str, value: Value) -> BridgeResult<()> {
        self.insert(name, value);
        Ok(())
    }

    fn keys(&self) -> Option<Vec<String>> {
        Some(self.entries.lock().keys().cloned().collect())
    }

    fn descriptor(&self) -> Option<Arc<ClassDescriptor>> {
        Some(MAP_DESCRIPTOR.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
