//! Guest objects
//!
//! One representation covers plain objects, arrays, functions, errors,
//! promises and proxies; [`ObjectKind`] selects the behavior. Own
//! properties live in an ordered descriptor table so enumeration order is
//! stable across the bridge.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::promise::PromiseData;
use crate::proxy::ProxyData;
use crate::value::{GuestValue, SymbolData};

/// Property key (string, integer index, or symbol)
#[derive(Clone, Debug)]
pub enum PropertyKey {
    /// String property key
    String(Rc<str>),
    /// Integer index (array elements)
    Index(u32),
    /// Symbol key; identity is the `Rc` allocation
    Symbol(Rc<SymbolData>),
}

impl PropertyKey {
    /// Create a string property key
    pub fn string(s: &str) -> Self {
        Self::String(Rc::from(s))
    }

    /// Render the key for error messages
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.to_string(),
            Self::Index(i) => i.to_string(),
            Self::Symbol(s) => match &s.description {
                Some(d) => format!("Symbol({d})"),
                None => "Symbol()".into(),
            },
        }
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Index(a), Self::Index(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for PropertyKey {}

impl Hash for PropertyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Index(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Self::Symbol(s) => {
                2u8.hash(state);
                (Rc::as_ptr(s) as usize).hash(state);
            }
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<u32> for PropertyKey {
    fn from(i: u32) -> Self {
        Self::Index(i)
    }
}

/// Property attributes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyAttributes {
    /// Property is writable (data properties only)
    pub writable: bool,
    /// Property shows up in enumeration
    pub enumerable: bool,
    /// Property may be redefined or deleted
    pub configurable: bool,
}

impl PropertyAttributes {
    /// Default data property attributes
    pub const fn data() -> Self {
        Self {
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::data()
    }
}

/// Property descriptor
#[derive(Clone, Debug)]
pub enum PropertyDescriptor {
    /// Data property
    Data {
        /// The value
        value: GuestValue,
        /// Attributes
        attributes: PropertyAttributes,
    },
    /// Accessor property
    Accessor {
        /// Getter function
        get: Option<GuestValue>,
        /// Setter function
        set: Option<GuestValue>,
        /// Attributes
        attributes: PropertyAttributes,
    },
}

impl PropertyDescriptor {
    /// Create a data property with default attributes
    pub fn data(value: GuestValue) -> Self {
        Self::Data {
            value,
            attributes: PropertyAttributes::data(),
        }
    }

    /// Attributes of either variant
    pub fn attributes(&self) -> PropertyAttributes {
        match self {
            Self::Data { attributes, .. } | Self::Accessor { attributes, .. } => *attributes,
        }
    }

}

/// Native function callback. Receives the engine, the `this` handle, the
/// argument handles (all borrowed; retain to keep) and a construct flag.
/// Returns an owned handle.
pub type NativeFn = Rc<
    dyn Fn(&crate::vm::Vm, crate::vm::NativeCall) -> crate::error::VmResult<crate::handle::GuestHandle>,
>;

/// A script-defined function (arrow)
pub struct ScriptFunction {
    /// Parameter names
    pub params: Vec<String>,
    /// Function body
    pub body: crate::parser::Body,
    /// Captured environment
    pub env: Rc<crate::interp::Env>,
}

/// Function implementation
#[derive(Clone)]
pub enum FnImpl {
    /// Backed by a Rust closure
    Native(NativeFn),
    /// Defined by script source
    Script(Rc<ScriptFunction>),
}

/// Callable payload
#[derive(Clone)]
pub struct FunctionData {
    /// Function name (may be empty)
    pub name: Rc<str>,
    /// Implementation
    pub imp: FnImpl,
}

/// What kind of object this is
pub enum ObjectKind {
    /// Ordinary object
    Plain,
    /// Array (elements vector plus ordinary properties)
    Array,
    /// Error object (message/name data properties)
    Error,
    /// Callable
    Function(FunctionData),
    /// Promise
    Promise(PromiseData),
    /// Proxy with native traps
    Proxy(ProxyData),
}

/// A guest object
pub struct GuestObject {
    /// Own properties, in definition order
    props: IndexMap<PropertyKey, PropertyDescriptor>,
    /// Prototype; `None` means the intrinsic default for this kind
    pub(crate) proto: Option<GuestValue>,
    /// Array elements (Array kind only)
    pub(crate) elements: Vec<GuestValue>,
    /// Object kind
    pub(crate) kind: ObjectKind,
}

impl GuestObject {
    /// Create an ordinary object
    pub fn plain() -> Self {
        Self {
            props: IndexMap::new(),
            proto: None,
            elements: Vec::new(),
            kind: ObjectKind::Plain,
        }
    }

    /// Create an array
    pub fn array() -> Self {
        Self {
            kind: ObjectKind::Array,
            ..Self::plain()
        }
    }

    /// Create a callable
    pub fn function(data: FunctionData) -> Self {
        Self {
            kind: ObjectKind::Function(data),
            ..Self::plain()
        }
    }

    /// Create an error object
    pub fn error() -> Self {
        Self {
            kind: ObjectKind::Error,
            ..Self::plain()
        }
    }

    /// Create a promise
    pub fn promise(data: PromiseData) -> Self {
        Self {
            kind: ObjectKind::Promise(data),
            ..Self::plain()
        }
    }

    /// Create a proxy
    pub fn proxy(data: ProxyData) -> Self {
        Self {
            kind: ObjectKind::Proxy(data),
            ..Self::plain()
        }
    }

    /// Kind accessor
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Whether this object can be called
    pub fn is_callable(&self) -> bool {
        match &self.kind {
            ObjectKind::Function(_) => true,
            ObjectKind::Proxy(p) => match p.target.as_object() {
                Some(t) => t.borrow().is_callable(),
                None => false,
            },
            _ => false,
        }
    }

    /// Whether this object is an array
    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array)
    }

    /// Own property descriptor, if present. Indexed reads on arrays see
    /// the elements vector.
    pub fn get_own(&self, key: &PropertyKey) -> Option<PropertyDescriptor> {
        if let Some(desc) = self.props.get(key) {
            return Some(desc.clone());
        }
        if let PropertyKey::Index(i) = key {
            let idx = *i as usize;
            if idx < self.elements.len() {
                return Some(PropertyDescriptor::data(self.elements[idx].clone()));
            }
        }
        if let PropertyKey::String(s) = key {
            if self.is_array() && &**s == "length" {
                return Some(PropertyDescriptor::data(GuestValue::Number(
                    self.array_length() as f64,
                )));
            }
        }
        None
    }

    /// Insert or replace a property without attribute checks
    pub fn define(&mut self, key: PropertyKey, desc: PropertyDescriptor) {
        if let PropertyKey::Index(i) = &key {
            if self.is_array() {
                if let PropertyDescriptor::Data { value, .. } = &desc {
                    let idx = *i as usize;
                    if idx >= self.elements.len() {
                        self.elements.resize(idx + 1, GuestValue::Undefined);
                    }
                    self.elements[idx] = value.clone();
                    return;
                }
            }
        }
        self.props.insert(key, desc);
    }

    /// Plain [[Set]] on a data property. Returns false when an existing
    /// descriptor rejects the write. Accessor dispatch is the engine's
    /// job; this only sees data slots.
    pub fn set_data(&mut self, key: PropertyKey, value: GuestValue) -> bool {
        if let Some(existing) = self.props.get_mut(&key) {
            match existing {
                PropertyDescriptor::Data { attributes, value: slot } => {
                    if !attributes.writable {
                        return false;
                    }
                    *slot = value;
                    true
                }
                // Accessor without setter rejects; with setter the engine
                // dispatches before reaching here.
                PropertyDescriptor::Accessor { .. } => false,
            }
        } else {
            self.define(key, PropertyDescriptor::data(value));
            true
        }
    }

    /// Delete an own property. Returns false for non-configurable ones.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        if let Some(desc) = self.props.get(key) {
            if !desc.attributes().configurable {
                return false;
            }
            self.props.shift_remove(key);
            return true;
        }
        if let PropertyKey::Index(i) = key {
            let idx = *i as usize;
            if idx < self.elements.len() {
                self.elements[idx] = GuestValue::Undefined;
                return true;
            }
        }
        true
    }

    /// Whether an own property exists
    pub fn has_own(&self, key: &PropertyKey) -> bool {
        if self.props.contains_key(key) {
            return true;
        }
        if let PropertyKey::Index(i) = key {
            return (*i as usize) < self.elements.len();
        }
        false
    }

    /// Own keys: array indices first, then table order
    pub fn own_keys(&self) -> Vec<PropertyKey> {
        let mut keys = Vec::with_capacity(self.elements.len() + self.props.len());
        for i in 0..self.elements.len() {
            keys.push(PropertyKey::Index(i as u32));
        }
        keys.extend(self.props.keys().cloned());
        keys
    }

    /// Number of array elements
    pub fn array_length(&self) -> usize {
        self.elements.len()
    }

    /// Append an array element
    pub fn push(&mut self, value: GuestValue) {
        self.elements.push(value);
    }

    pub(crate) fn render(&self) -> String {
        match &self.kind {
            ObjectKind::Plain => "[object Object]".into(),
            ObjectKind::Array => format!("[array({})]", self.elements.len()),
            ObjectKind::Function(f) => format!("[function {}]", f.name),
            ObjectKind::Promise(_) => "[object Promise]".into(),
            ObjectKind::Proxy(_) => "[object Proxy]".into(),
            ObjectKind::Error => {
                let msg = self
                    .get_own(&PropertyKey::string("message"))
                    .and_then(|d| match d {
                        PropertyDescriptor::Data { value, .. } => Some(value.render()),
                        PropertyDescriptor::Accessor { .. } => None,
                    })
                    .unwrap_or_default();
                format!("Error: {msg}")
            }
        }
    }
}

/// Shared object reference
pub type ObjectRef = Rc<RefCell<GuestObject>>;

/// Convenience: wrap a fresh object
pub fn object_ref(obj: GuestObject) -> ObjectRef {
    Rc::new(RefCell::new(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_set_get() {
        let mut obj = GuestObject::plain();
        assert!(obj.set_data(PropertyKey::string("foo"), GuestValue::Number(42.0)));
        let got = obj.get_own(&PropertyKey::string("foo")).unwrap();
        match got {
            PropertyDescriptor::Data { value, .. } => assert!(value.same_value(&GuestValue::Number(42.0))),
            PropertyDescriptor::Accessor { .. } => panic!("expected data property"),
        }
    }

    #[test]
    fn test_non_writable_rejects_set() {
        let mut obj = GuestObject::plain();
        obj.define(
            PropertyKey::string("k"),
            PropertyDescriptor::Data {
                value: GuestValue::Number(1.0),
                attributes: PropertyAttributes {
                    writable: false,
                    enumerable: true,
                    configurable: true,
                },
            },
        );
        assert!(!obj.set_data(PropertyKey::string("k"), GuestValue::Number(2.0)));
    }

    #[test]
    fn test_non_configurable_rejects_delete() {
        let mut obj = GuestObject::plain();
        obj.define(
            PropertyKey::string("k"),
            PropertyDescriptor::Data {
                value: GuestValue::Number(1.0),
                attributes: PropertyAttributes {
                    writable: true,
                    enumerable: true,
                    configurable: false,
                },
            },
        );
        assert!(!obj.delete(&PropertyKey::string("k")));
        assert!(obj.has_own(&PropertyKey::string("k")));
    }

    #[test]
    fn test_array_elements() {
        let mut arr = GuestObject::array();
        arr.push(GuestValue::Number(1.0));
        arr.push(GuestValue::Number(2.0));
        assert_eq!(arr.array_length(), 2);
        assert!(arr.has_own(&PropertyKey::Index(1)));
        let keys = arr.own_keys();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_array_length_pseudo_property() {
        let mut arr = GuestObject::array();
        arr.push(GuestValue::Bool(true));
        let len = arr.get_own(&PropertyKey::string("length")).unwrap();
        match len {
            PropertyDescriptor::Data { value, .. } => assert!(value.same_value(&GuestValue::Number(1.0))),
            PropertyDescriptor::Accessor { .. } => panic!("expected data"),
        }
    }
}
