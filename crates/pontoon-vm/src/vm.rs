//! The engine façade
//!
//! All embedder access goes through [`Vm`]: handle lifecycle, property
//! operations, calls, eval, promises, the pending-job queue, and the
//! weak identity-tag table. `Vm` is a cheap clone of shared state; the
//! engine is single-threaded and re-entrant (native callbacks may call
//! back into the engine).

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::handle::{GuestHandle, HandleTable};
use crate::interp;
use crate::object::{
    FnImpl, FunctionData, GuestObject, NativeFn, ObjectKind, ObjectRef, PropertyAttributes,
    PropertyDescriptor, PropertyKey, object_ref,
};
use crate::promise::{Job, PromiseData, PromiseState, Reaction};
use crate::proxy::{ProxyData, ProxyTraps};
use crate::value::{GuestValue, SymbolData, format_number};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Arguments passed to a native function. `this` and `args` are borrowed
/// handles, released by the engine after the call returns; retain any you
/// keep (including one you return). The returned handle is owned by the
/// engine caller.
pub struct NativeCall {
    /// `this` binding
    pub this: GuestHandle,
    /// Positional arguments
    pub args: Vec<GuestHandle>,
    /// True when invoked via `new`
    pub construct: bool,
}

/// Descriptor exchanged across the engine API. Value/getter/setter are
/// handles: owned by the caller when returned from `own_descriptor`,
/// borrowed when passed to `define_prop`.
pub struct GuestPropertyDescriptor {
    /// Data value
    pub value: Option<GuestHandle>,
    /// Getter
    pub get: Option<GuestHandle>,
    /// Setter
    pub set: Option<GuestHandle>,
    /// Property attributes
    pub attributes: PropertyAttributes,
}

/// Proxy trap handles for [`Vm::new_proxy`] (borrowed)
#[derive(Default)]
pub struct ProxyTrapHandles {
    /// `get(target, key)`
    pub get: Option<GuestHandle>,
    /// `set(target, key, value)` returning a boolean
    pub set: Option<GuestHandle>,
    /// `delete(target, key)` returning a boolean
    pub delete: Option<GuestHandle>,
}

enum TagRef {
    Obj(Weak<RefCell<GuestObject>>),
    Sym(Weak<SymbolData>),
}

struct Intrinsics {
    object_proto: ObjectRef,
    array_proto: ObjectRef,
    function_proto: ObjectRef,
    error_proto: ObjectRef,
    promise_proto: ObjectRef,
}

struct VmInner {
    handles: HandleTable,
    global: ObjectRef,
    intrinsics: Intrinsics,
    jobs: VecDeque<Job>,
    tags: FxHashMap<usize, (TagRef, u64)>,
}

/// A guest engine instance
#[derive(Clone)]
pub struct Vm {
    inner: Rc<RefCell<VmInner>>,
    id: u64,
}

impl Vm {
    /// Create an engine instance with its intrinsics and builtins
    pub fn new() -> Self {
        let object_proto = object_ref(GuestObject::plain());
        object_proto.borrow_mut().proto = Some(GuestValue::Null);
        let intrinsics = Intrinsics {
            object_proto,
            array_proto: object_ref(GuestObject::plain()),
            function_proto: object_ref(GuestObject::plain()),
            error_proto: object_ref(GuestObject::plain()),
            promise_proto: object_ref(GuestObject::plain()),
        };
        let vm = Self {
            inner: Rc::new(RefCell::new(VmInner {
                handles: HandleTable::new(),
                global: object_ref(GuestObject::plain()),
                intrinsics,
                jobs: VecDeque::new(),
                tags: FxHashMap::default(),
            })),
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
        };
        vm.install_builtins();
        vm
    }

    /// Engine instance id; handles carry it
    pub fn id(&self) -> u64 {
        self.id
    }

    // ---- handle lifecycle ----

    fn check(&self, h: GuestHandle) -> VmResult<()> {
        if h.vm != self.id {
            return Err(VmError::WrongVm);
        }
        Ok(())
    }

    pub(crate) fn alloc(&self, v: GuestValue) -> GuestHandle {
        let slot = self.inner.borrow_mut().handles.alloc(v);
        GuestHandle { vm: self.id, slot }
    }

    pub(crate) fn value(&self, h: GuestHandle) -> VmResult<GuestValue> {
        self.check(h)?;
        self.inner.borrow().handles.value(h.slot)
    }

    /// Increment the external reference count; returns the same handle
    pub fn retain(&self, h: GuestHandle) -> VmResult<GuestHandle> {
        self.check(h)?;
        self.inner.borrow_mut().handles.retain(h.slot)?;
        Ok(h)
    }

    /// Decrement the external reference count. Releasing a dead handle is
    /// a no-op.
    pub fn release(&self, h: GuestHandle) {
        if h.vm == self.id {
            self.inner.borrow_mut().handles.release(h.slot);
        }
    }

    /// Whether the handle still holds its value
    pub fn is_alive(&self, h: GuestHandle) -> bool {
        h.vm == self.id && self.inner.borrow().handles.is_alive(h.slot)
    }

    /// Number of live external handles (diagnostics)
    pub fn live_handles(&self) -> usize {
        self.inner.borrow().handles.live_count()
    }

    // ---- constructors ----

    /// The `undefined` value
    pub fn undefined(&self) -> GuestHandle {
        self.alloc(GuestValue::Undefined)
    }

    /// The `null` value
    pub fn null_handle(&self) -> GuestHandle {
        self.alloc(GuestValue::Null)
    }

    /// A boolean
    pub fn new_bool(&self, b: bool) -> GuestHandle {
        self.alloc(GuestValue::Bool(b))
    }

    /// A number
    pub fn new_number(&self, n: f64) -> GuestHandle {
        self.alloc(GuestValue::Number(n))
    }

    /// A string
    pub fn new_string(&self, s: &str) -> GuestHandle {
        self.alloc(GuestValue::String(Rc::from(s)))
    }

    /// A unique symbol
    pub fn new_symbol(&self, description: Option<&str>) -> GuestHandle {
        self.alloc(GuestValue::Symbol(Rc::new(SymbolData {
            description: description.map(str::to_string),
        })))
    }

    /// An empty object
    pub fn new_object(&self) -> GuestHandle {
        self.alloc(self.new_object_value())
    }

    pub(crate) fn new_object_value(&self) -> GuestValue {
        GuestValue::Object(object_ref(GuestObject::plain()))
    }

    /// An empty array
    pub fn new_array(&self) -> GuestHandle {
        self.alloc(GuestValue::Object(object_ref(GuestObject::array())))
    }

    /// An error object with a message
    pub fn new_error(&self, message: &str) -> GuestHandle {
        self.alloc(self.new_error_value(message))
    }

    fn new_error_value(&self, message: &str) -> GuestValue {
        let obj = object_ref(GuestObject::error());
        obj.borrow_mut().set_data(
            PropertyKey::string("name"),
            GuestValue::String(Rc::from("Error")),
        );
        obj.borrow_mut().set_data(
            PropertyKey::string("message"),
            GuestValue::String(Rc::from(message)),
        );
        obj.borrow_mut().proto = Some(GuestValue::Object(
            self.inner.borrow().intrinsics.error_proto.clone(),
        ));
        GuestValue::Object(obj)
    }

    /// A native function
    pub fn new_function(&self, name: &str, f: NativeFn) -> GuestHandle {
        self.alloc(GuestValue::Object(object_ref(GuestObject::function(
            FunctionData {
                name: Rc::from(name),
                imp: FnImpl::Native(f),
            },
        ))))
    }

    /// A proxy around `target` with native traps (all handles borrowed)
    pub fn new_proxy(&self, target: GuestHandle, traps: ProxyTrapHandles) -> VmResult<GuestHandle> {
        let target_v = self.value(target)?;
        if target_v.as_object().is_none() {
            return Err(VmError::type_error("proxy target must be an object"));
        }
        let resolve = |h: Option<GuestHandle>| -> VmResult<Option<GuestValue>> {
            match h {
                Some(h) => Ok(Some(self.value(h)?)),
                None => Ok(None),
            }
        };
        let traps = ProxyTraps {
            get: resolve(traps.get)?,
            set: resolve(traps.set)?,
            delete: resolve(traps.delete)?,
        };
        Ok(self.alloc(GuestValue::Object(object_ref(GuestObject::proxy(
            ProxyData::new(target_v, traps),
        )))))
    }

    // ---- introspection ----

    /// `typeof`-style tag
    pub fn type_of(&self, h: GuestHandle) -> VmResult<&'static str> {
        Ok(self.value(h)?.type_of())
    }

    /// Is the value `null`
    pub fn is_null(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(matches!(self.value(h)?, GuestValue::Null))
    }

    /// Is the value an array
    pub fn is_array(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(match self.value(h)?.as_object() {
            Some(o) => o.borrow().is_array(),
            None => false,
        })
    }

    /// Is the value an error object
    pub fn is_error(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(match self.value(h)?.as_object() {
            Some(o) => matches!(o.borrow().kind(), ObjectKind::Error),
            None => false,
        })
    }

    /// Is the value a promise
    pub fn is_promise(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(match self.value(h)?.as_object() {
            Some(o) => matches!(o.borrow().kind(), ObjectKind::Promise(_)),
            None => false,
        })
    }

    /// Is the value callable
    pub fn is_function(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(match self.value(h)?.as_object() {
            Some(o) => o.borrow().is_callable(),
            None => false,
        })
    }

    /// Is the value a proxy
    pub fn is_proxy(&self, h: GuestHandle) -> VmResult<bool> {
        Ok(match self.value(h)?.as_object() {
            Some(o) => matches!(o.borrow().kind(), ObjectKind::Proxy(_)),
            None => false,
        })
    }

    /// Proxy target, if `h` is a proxy (owned handle)
    pub fn proxy_target(&self, h: GuestHandle) -> VmResult<Option<GuestHandle>> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Ok(None);
        };
        let target = match o.borrow().kind() {
            ObjectKind::Proxy(p) => Some(p.target.clone()),
            _ => None,
        };
        Ok(target.map(|t| self.alloc(t)))
    }

    /// Number payload
    pub fn as_number(&self, h: GuestHandle) -> VmResult<Option<f64>> {
        Ok(match self.value(h)? {
            GuestValue::Number(n) => Some(n),
            _ => None,
        })
    }

    /// String payload
    pub fn as_string(&self, h: GuestHandle) -> VmResult<Option<String>> {
        Ok(match self.value(h)? {
            GuestValue::String(s) => Some(s.to_string()),
            _ => None,
        })
    }

    /// Boolean payload
    pub fn as_bool(&self, h: GuestHandle) -> VmResult<Option<bool>> {
        Ok(match self.value(h)? {
            GuestValue::Bool(b) => Some(b),
            _ => None,
        })
    }

    /// Strict identity of two handles' values
    pub fn same_value(&self, a: GuestHandle, b: GuestHandle) -> VmResult<bool> {
        Ok(self.value(a)?.same_value(&self.value(b)?))
    }

    /// Symbol description
    pub fn symbol_description(&self, h: GuestHandle) -> VmResult<Option<String>> {
        match self.value(h)? {
            GuestValue::Symbol(s) => Ok(s.description.clone()),
            _ => Err(VmError::type_error("not a symbol")),
        }
    }

    /// Function name (empty string for anonymous)
    pub fn function_name(&self, h: GuestHandle) -> VmResult<String> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Err(VmError::type_error("not a function"));
        };
        match o.borrow().kind() {
            ObjectKind::Function(f) => Ok(f.name.to_string()),
            ObjectKind::Proxy(_) => Ok(String::new()),
            _ => Err(VmError::type_error("not a function")),
        }
    }

    /// Best-effort string rendering (for messages)
    pub fn render(&self, h: GuestHandle) -> VmResult<String> {
        Ok(self.value(h)?.render())
    }

    /// `instanceof` via the prototype chain
    pub fn instance_of(&self, h: GuestHandle, ctor: GuestHandle) -> VmResult<bool> {
        let v = self.value(h)?;
        let c = self.value(ctor)?;
        self.instance_of_value(&v, &c)
    }

    fn instance_of_value(&self, v: &GuestValue, ctor: &GuestValue) -> VmResult<bool> {
        let Some(cobj) = ctor.as_object() else {
            return Err(VmError::type_error("right-hand side is not callable"));
        };
        let target = self.unwrap_proxy_obj(cobj);
        let proto = target
            .borrow()
            .get_own(&PropertyKey::string("prototype"))
            .and_then(|d| match d {
                PropertyDescriptor::Data { value, .. } => Some(value),
                PropertyDescriptor::Accessor { .. } => None,
            });
        let Some(proto) = proto else {
            return Ok(false);
        };
        let mut cur = v.clone();
        loop {
            let Some(o) = cur.as_object().cloned() else {
                return Ok(false);
            };
            let Some(next) = self.effective_proto(&o) else {
                return Ok(false);
            };
            if next.same_value(&proto) {
                return Ok(true);
            }
            cur = next;
        }
    }

    fn unwrap_proxy_obj(&self, o: &ObjectRef) -> ObjectRef {
        let target = match o.borrow().kind() {
            ObjectKind::Proxy(p) => p.target.as_object().cloned(),
            _ => None,
        };
        match target {
            Some(t) => self.unwrap_proxy_obj(&t),
            None => o.clone(),
        }
    }

    fn effective_proto(&self, o: &ObjectRef) -> Option<GuestValue> {
        let explicit = o.borrow().proto.clone();
        match explicit {
            Some(GuestValue::Null) => None,
            Some(v) => Some(v),
            None => {
                let inner = self.inner.borrow();
                let i = &inner.intrinsics;
                let proto = match o.borrow().kind() {
                    ObjectKind::Plain => i.object_proto.clone(),
                    ObjectKind::Array => i.array_proto.clone(),
                    ObjectKind::Function(_) => i.function_proto.clone(),
                    ObjectKind::Error => i.error_proto.clone(),
                    ObjectKind::Promise(_) => i.promise_proto.clone(),
                    ObjectKind::Proxy(p) => {
                        let target = p.target.as_object().cloned();
                        drop(inner);
                        return target.and_then(|t| self.effective_proto(&t));
                    }
                };
                Some(GuestValue::Object(proto))
            }
        }
    }

    // ---- property operations ----

    /// Convert a handle to a property key (string, integer or symbol)
    pub fn prop_key(&self, h: GuestHandle) -> VmResult<PropertyKey> {
        match self.value(h)? {
            GuestValue::String(s) => Ok(PropertyKey::String(s)),
            GuestValue::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => {
                Ok(PropertyKey::Index(n as u32))
            }
            GuestValue::Number(n) => Ok(PropertyKey::String(Rc::from(format_number(n).as_str()))),
            GuestValue::Symbol(s) => Ok(PropertyKey::Symbol(s)),
            other => Err(VmError::type_error(format!(
                "invalid property key: {}",
                other.type_of()
            ))),
        }
    }

    /// A handle holding the key as a guest value (owned)
    pub fn key_handle(&self, key: &PropertyKey) -> GuestHandle {
        self.alloc(Self::key_to_value(key))
    }

    fn key_to_value(key: &PropertyKey) -> GuestValue {
        match key {
            PropertyKey::String(s) => GuestValue::String(s.clone()),
            PropertyKey::Index(i) => GuestValue::Number(*i as f64),
            PropertyKey::Symbol(s) => GuestValue::Symbol(s.clone()),
        }
    }

    /// Read a property (through getters, prototypes and proxy traps);
    /// returns an owned handle
    pub fn get_prop(&self, h: GuestHandle, key: &PropertyKey) -> VmResult<GuestHandle> {
        let target = self.value(h)?;
        let v = self.get_prop_value(&target, key, target.clone())?;
        Ok(self.alloc(v))
    }

    pub(crate) fn get_prop_value(
        &self,
        target: &GuestValue,
        key: &PropertyKey,
        receiver: GuestValue,
    ) -> VmResult<GuestValue> {
        match target {
            GuestValue::Object(o) => {
                let proxy = match o.borrow().kind() {
                    ObjectKind::Proxy(p) => Some((p.trap("get"), p.target.clone())),
                    _ => None,
                };
                if let Some((trap, inner_target)) = proxy {
                    return match trap {
                        Some(f) => {
                            let key_v = Self::key_to_value(key);
                            self.call_value(&f, GuestValue::Undefined, vec![inner_target, key_v])
                        }
                        None => self.get_prop_value(&inner_target, key, inner_target.clone()),
                    };
                }
                let own = o.borrow().get_own(key);
                match own {
                    Some(PropertyDescriptor::Data { value, .. }) => Ok(value),
                    Some(PropertyDescriptor::Accessor { get: Some(g), .. }) => {
                        self.call_value(&g, receiver, Vec::new())
                    }
                    Some(PropertyDescriptor::Accessor { get: None, .. }) => {
                        Ok(GuestValue::Undefined)
                    }
                    None => match self.effective_proto(o) {
                        Some(proto) => self.get_prop_value(&proto, key, receiver),
                        None => Ok(GuestValue::Undefined),
                    },
                }
            }
            GuestValue::String(s) => {
                if let PropertyKey::String(k) = key {
                    if &**k == "length" {
                        return Ok(GuestValue::Number(s.chars().count() as f64));
                    }
                }
                Ok(GuestValue::Undefined)
            }
            GuestValue::Undefined | GuestValue::Null => Err(VmError::type_error(format!(
                "cannot read property '{}' of {}",
                key.render(),
                target.type_of()
            ))),
            _ => Ok(GuestValue::Undefined),
        }
    }

    /// Write a property (through setters, prototypes and proxy traps)
    pub fn set_prop(&self, h: GuestHandle, key: PropertyKey, value: GuestHandle) -> VmResult<bool> {
        let target = self.value(h)?;
        let v = self.value(value)?;
        self.set_prop_value(&target, key, v)
    }

    pub(crate) fn set_prop_value(
        &self,
        target: &GuestValue,
        key: PropertyKey,
        value: GuestValue,
    ) -> VmResult<bool> {
        let GuestValue::Object(obj) = target else {
            return match target {
                GuestValue::Undefined | GuestValue::Null => Err(VmError::type_error(format!(
                    "cannot set property '{}' of {}",
                    key.render(),
                    target.type_of()
                ))),
                _ => Ok(false),
            };
        };

        let proxy = match obj.borrow().kind() {
            ObjectKind::Proxy(p) => Some((p.trap("set"), p.target.clone())),
            _ => None,
        };
        if let Some((trap, inner_target)) = proxy {
            return match trap {
                Some(f) => {
                    let key_v = Self::key_to_value(&key);
                    let res = self.call_value(
                        &f,
                        GuestValue::Undefined,
                        vec![inner_target, key_v, value],
                    )?;
                    Ok(res.is_truthy())
                }
                None => self.set_prop_value(&inner_target, key, value),
            };
        }

        // Find an existing property along the chain: accessors dispatch,
        // read-only data properties reject, otherwise define on target.
        let mut cur = obj.clone();
        loop {
            let own = cur.borrow().get_own(&key);
            match own {
                Some(PropertyDescriptor::Accessor { set: Some(s), .. }) => {
                    self.call_value(&s, target.clone(), vec![value])?;
                    return Ok(true);
                }
                Some(PropertyDescriptor::Accessor { set: None, .. }) => return Ok(false),
                Some(PropertyDescriptor::Data { attributes, .. }) => {
                    if !attributes.writable {
                        return Ok(false);
                    }
                    break;
                }
                None => match self.effective_proto(&cur) {
                    Some(GuestValue::Object(next)) => cur = next,
                    _ => break,
                },
            }
        }
        Ok(obj.borrow_mut().set_data(key, value))
    }

    /// Delete a property (through proxy traps)
    pub fn delete_prop(&self, h: GuestHandle, key: &PropertyKey) -> VmResult<bool> {
        let target = self.value(h)?;
        self.delete_prop_value(&target, key)
    }

    pub(crate) fn delete_prop_value(&self, target: &GuestValue, key: &PropertyKey) -> VmResult<bool> {
        let GuestValue::Object(obj) = target else {
            return match target {
                GuestValue::Undefined | GuestValue::Null => {
                    Err(VmError::type_error("cannot delete property of nullish value"))
                }
                _ => Ok(true),
            };
        };
        let proxy = match obj.borrow().kind() {
            ObjectKind::Proxy(p) => Some((p.trap("delete"), p.target.clone())),
            _ => None,
        };
        if let Some((trap, inner_target)) = proxy {
            return match trap {
                Some(f) => {
                    let key_v = Self::key_to_value(key);
                    let res =
                        self.call_value(&f, GuestValue::Undefined, vec![inner_target, key_v])?;
                    Ok(res.is_truthy())
                }
                None => self.delete_prop_value(&inner_target, key),
            };
        }
        Ok(obj.borrow_mut().delete(key))
    }

    pub(crate) fn has_prop_value(&self, target: &GuestValue, key: &PropertyKey) -> VmResult<bool> {
        let Some(obj) = target.as_object() else {
            return Ok(false);
        };
        let target_obj = self.unwrap_proxy_obj(obj);
        if target_obj.borrow().has_own(key) {
            return Ok(true);
        }
        match self.effective_proto(&target_obj) {
            Some(proto) => self.has_prop_value(&proto, key),
            None => Ok(false),
        }
    }

    /// Own property keys (proxies enumerate their target)
    pub fn own_keys(&self, h: GuestHandle) -> VmResult<Vec<PropertyKey>> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Err(VmError::type_error("own_keys on non-object"));
        };
        let target = self.unwrap_proxy_obj(o);
        let keys = target.borrow().own_keys();
        Ok(keys)
    }

    /// Full own property descriptor; value/get/set are owned handles
    pub fn own_descriptor(
        &self,
        h: GuestHandle,
        key: &PropertyKey,
    ) -> VmResult<Option<GuestPropertyDescriptor>> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Err(VmError::type_error("own_descriptor on non-object"));
        };
        let target = self.unwrap_proxy_obj(o);
        let own = target.borrow().get_own(key);
        Ok(own.map(|desc| match desc {
            PropertyDescriptor::Data { value, attributes } => GuestPropertyDescriptor {
                value: Some(self.alloc(value)),
                get: None,
                set: None,
                attributes,
            },
            PropertyDescriptor::Accessor {
                get,
                set,
                attributes,
            } => GuestPropertyDescriptor {
                value: None,
                get: get.map(|g| self.alloc(g)),
                set: set.map(|s| self.alloc(s)),
                attributes,
            },
        }))
    }

    /// Define a property with explicit attributes (handles borrowed)
    pub fn define_prop(
        &self,
        h: GuestHandle,
        key: PropertyKey,
        desc: &GuestPropertyDescriptor,
    ) -> VmResult<()> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Err(VmError::type_error("define_prop on non-object"));
        };
        let target = self.unwrap_proxy_obj(o);
        let descriptor = if desc.get.is_some() || desc.set.is_some() {
            PropertyDescriptor::Accessor {
                get: desc.get.map(|g| self.value(g)).transpose()?,
                set: desc.set.map(|s| self.value(s)).transpose()?,
                attributes: desc.attributes,
            }
        } else {
            PropertyDescriptor::Data {
                value: match desc.value {
                    Some(h) => self.value(h)?,
                    None => GuestValue::Undefined,
                },
                attributes: desc.attributes,
            }
        };
        target.borrow_mut().define(key, descriptor);
        Ok(())
    }

    /// The prototype, when it differs from the kind's intrinsic default.
    /// Owned handle.
    pub fn custom_proto_of(&self, h: GuestHandle) -> VmResult<Option<GuestHandle>> {
        let v = self.value(h)?;
        let Some(o) = v.as_object() else {
            return Ok(None);
        };
        let target = self.unwrap_proxy_obj(o);
        let explicit = target.borrow().proto.clone();
        let Some(proto) = explicit else {
            return Ok(None);
        };
        if matches!(proto, GuestValue::Null) {
            return Ok(None);
        }
        let inner = self.inner.borrow();
        let i = &inner.intrinsics;
        for default in [
            &i.object_proto,
            &i.array_proto,
            &i.function_proto,
            &i.error_proto,
            &i.promise_proto,
        ] {
            if proto.same_value(&GuestValue::Object(default.clone())) {
                return Ok(None);
            }
        }
        drop(inner);
        Ok(Some(self.alloc(proto)))
    }

    /// Set the prototype (handles borrowed)
    pub fn set_proto(&self, h: GuestHandle, proto: GuestHandle) -> VmResult<()> {
        let v = self.value(h)?;
        let p = self.value(proto)?;
        let Some(o) = v.as_object() else {
            return Err(VmError::type_error("set_proto on non-object"));
        };
        let target = self.unwrap_proxy_obj(o);
        target.borrow_mut().proto = Some(p);
        Ok(())
    }

    // ---- calls ----

    /// Call a function value. Returns an owned handle; guest throws
    /// surface as [`VmError::Exception`].
    pub fn call_function(
        &self,
        f: GuestHandle,
        this: GuestHandle,
        args: &[GuestHandle],
    ) -> VmResult<GuestHandle> {
        let fv = self.value(f)?;
        let this_v = self.value(this)?;
        let mut argv = Vec::with_capacity(args.len());
        for a in args {
            argv.push(self.value(*a)?);
        }
        let result = self
            .call_value(&fv, this_v, argv)
            .map_err(|e| self.escalate(e))?;
        Ok(self.alloc(result))
    }

    /// Construct via `new`. Returns an owned handle.
    pub fn construct(&self, f: GuestHandle, args: &[GuestHandle]) -> VmResult<GuestHandle> {
        let fv = self.value(f)?;
        let mut argv = Vec::with_capacity(args.len());
        for a in args {
            argv.push(self.value(*a)?);
        }
        let result = self
            .construct_value(&fv, argv)
            .map_err(|e| self.escalate(e))?;
        Ok(self.alloc(result))
    }

    pub(crate) fn call_value(
        &self,
        f: &GuestValue,
        this: GuestValue,
        args: Vec<GuestValue>,
    ) -> VmResult<GuestValue> {
        let data = self.resolve_callable(f)?;
        match &data.imp {
            FnImpl::Script(sf) => interp::call_script(self, sf, args),
            FnImpl::Native(native) => self.invoke_native(native.clone(), this, args, false),
        }
    }

    pub(crate) fn construct_value(&self, f: &GuestValue, args: Vec<GuestValue>) -> VmResult<GuestValue> {
        let data = self.resolve_callable(f)?;
        // instance prototype comes from the function's `prototype` property
        let proto = f
            .as_object()
            .map(|o| self.unwrap_proxy_obj(o))
            .and_then(|o| o.borrow().get_own(&PropertyKey::string("prototype")))
            .and_then(|d| match d {
                PropertyDescriptor::Data { value, .. } => value.as_object().cloned(),
                PropertyDescriptor::Accessor { .. } => None,
            });
        let instance = object_ref(GuestObject::plain());
        if let Some(p) = proto {
            instance.borrow_mut().proto = Some(GuestValue::Object(p));
        }
        let instance_v = GuestValue::Object(instance);
        let result = match &data.imp {
            FnImpl::Script(sf) => interp::call_script(self, sf, args)?,
            FnImpl::Native(native) => {
                self.invoke_native(native.clone(), instance_v.clone(), args, true)?
            }
        };
        if result.as_object().is_some() {
            Ok(result)
        } else {
            Ok(instance_v)
        }
    }

    fn resolve_callable(&self, f: &GuestValue) -> VmResult<FunctionData> {
        let Some(o) = f.as_object() else {
            return Err(VmError::type_error(format!("{} is not a function", f.render())));
        };
        let next = match o.borrow().kind() {
            ObjectKind::Function(data) => return Ok(data.clone()),
            ObjectKind::Proxy(p) => p.target.clone(),
            _ => {
                return Err(VmError::type_error(format!(
                    "{} is not a function",
                    f.render()
                )));
            }
        };
        self.resolve_callable(&next)
    }

    fn invoke_native(
        &self,
        native: NativeFn,
        this: GuestValue,
        args: Vec<GuestValue>,
        construct: bool,
    ) -> VmResult<GuestValue> {
        let this_h = self.alloc(this);
        let arg_hs: Vec<GuestHandle> = args.into_iter().map(|a| self.alloc(a)).collect();
        let call = NativeCall {
            this: this_h,
            args: arg_hs.clone(),
            construct,
        };
        let result = native(self, call);
        let out = match result {
            Ok(h) => {
                let v = self.value(h)?;
                self.release(h);
                Ok(v)
            }
            Err(e) => Err(e),
        };
        self.release(this_h);
        for h in arg_hs {
            self.release(h);
        }
        out
    }

    /// Build a throwable error from a handle (borrowed). Native
    /// functions use this to raise a guest value.
    pub fn throw(&self, h: GuestHandle) -> VmError {
        match self.value(h) {
            Ok(v) => self.throw_value(v),
            Err(e) => e,
        }
    }

    pub(crate) fn throw_value(&self, v: GuestValue) -> VmError {
        let message = v.render();
        VmError::Exception {
            handle: self.alloc(v),
            message,
        }
    }

    /// Turn engine-internal type/reference errors into guest exceptions
    /// at API boundaries, so embedders see a throwable value.
    fn escalate(&self, e: VmError) -> VmError {
        match e {
            VmError::Type(msg) | VmError::Reference(msg) => {
                self.throw_value(self.new_error_value(&msg))
            }
            other => other,
        }
    }

    // ---- eval ----

    /// Evaluate script source; owned result handle
    pub fn eval_code(&self, src: &str) -> VmResult<GuestHandle> {
        let program = crate::parser::parse_program(src)?;
        let result = interp::eval_program(self, &program).map_err(|e| self.escalate(e))?;
        Ok(self.alloc(result))
    }

    /// The global object (owned handle)
    pub fn global(&self) -> GuestHandle {
        self.alloc(self.global_value())
    }

    pub(crate) fn global_value(&self) -> GuestValue {
        GuestValue::Object(self.inner.borrow().global.clone())
    }

    /// Install a global binding (handle borrowed)
    pub fn set_global(&self, name: &str, h: GuestHandle) -> VmResult<()> {
        let v = self.value(h)?;
        self.set_prop_value(&self.global_value(), PropertyKey::string(name), v)?;
        Ok(())
    }

    // ---- promises and jobs ----

    /// A fresh pending promise (owned handle)
    pub fn new_promise(&self) -> GuestHandle {
        self.alloc(GuestValue::Object(object_ref(GuestObject::promise(
            PromiseData::pending(),
        ))))
    }

    /// Resolve a pending promise; reactions are queued, not run
    pub fn resolve_promise(&self, p: GuestHandle, value: GuestHandle) -> VmResult<()> {
        self.settle(p, value, true)
    }

    /// Reject a pending promise; reactions are queued, not run
    pub fn reject_promise(&self, p: GuestHandle, reason: GuestHandle) -> VmResult<()> {
        self.settle(p, reason, false)
    }

    fn settle(&self, p: GuestHandle, value: GuestHandle, fulfill: bool) -> VmResult<()> {
        let pv = self.value(p)?;
        let v = self.value(value)?;
        let Some(obj) = pv.as_object() else {
            return Err(VmError::type_error("not a promise"));
        };
        let mut jobs = Vec::new();
        {
            let mut b = obj.borrow_mut();
            let ObjectKind::Promise(data) = &mut b.kind else {
                return Err(VmError::type_error("not a promise"));
            };
            if !matches!(data.state, PromiseState::Pending) {
                return Ok(()); // already settled; ignore
            }
            data.state = if fulfill {
                PromiseState::Fulfilled(v.clone())
            } else {
                PromiseState::Rejected(v.clone())
            };
            for reaction in data.reactions.drain(..) {
                let cb = if fulfill {
                    reaction.on_fulfilled
                } else {
                    reaction.on_rejected
                };
                if let Some(cb) = cb {
                    jobs.push(Job {
                        callback: cb,
                        argument: v.clone(),
                    });
                }
            }
        }
        self.inner.borrow_mut().jobs.extend(jobs);
        Ok(())
    }

    /// Whether continuations are waiting to run
    pub fn has_pending_jobs(&self) -> bool {
        !self.inner.borrow().jobs.is_empty()
    }

    /// Drain the pending-job queue (FIFO). Jobs enqueued while draining
    /// also run. Stops at `limit` jobs when given. Returns the number of
    /// executed jobs; the first failing job aborts the drain with its
    /// error and leaves the rest queued.
    pub fn execute_pending_jobs(&self, limit: Option<usize>) -> VmResult<usize> {
        let mut count = 0usize;
        loop {
            if let Some(limit) = limit {
                if count >= limit {
                    return Ok(count);
                }
            }
            let job = self.inner.borrow_mut().jobs.pop_front();
            let Some(job) = job else {
                return Ok(count);
            };
            self.call_value(&job.callback, GuestValue::Undefined, vec![job.argument])
                .map_err(|e| self.escalate(e))?;
            count += 1;
        }
    }

    // ---- identity tags ----

    /// Associate a counter with the handle's underlying value. The
    /// association is weak: it never keeps the value alive. Object-shaped
    /// values only.
    pub fn set_tag(&self, h: GuestHandle, counter: u64) -> VmResult<()> {
        let v = self.value(h)?;
        let (addr, tag) = match &v {
            GuestValue::Object(o) => (Rc::as_ptr(o) as usize, TagRef::Obj(Rc::downgrade(o))),
            GuestValue::Symbol(s) => (Rc::as_ptr(s) as usize, TagRef::Sym(Rc::downgrade(s))),
            _ => return Err(VmError::type_error("cannot tag a primitive")),
        };
        self.inner.borrow_mut().tags.insert(addr, (tag, counter));
        Ok(())
    }

    /// Counter previously set for the handle's value, if the value is
    /// still live. Works on disposed handles through the weak shadow.
    pub fn tag_of(&self, h: GuestHandle) -> VmResult<Option<u64>> {
        self.check(h)?;
        let v = self.inner.borrow().handles.shadow_value(h.slot);
        let Some(v) = v else {
            return Ok(None);
        };
        let Some(addr) = v.heap_addr() else {
            return Ok(None);
        };
        let mut inner = self.inner.borrow_mut();
        let valid = match inner.tags.get(&addr) {
            Some((TagRef::Obj(w), counter)) => w
                .upgrade()
                .filter(|u| Rc::as_ptr(u) as usize == addr)
                .map(|_| *counter),
            Some((TagRef::Sym(w), counter)) => w
                .upgrade()
                .filter(|u| Rc::as_ptr(u) as usize == addr)
                .map(|_| *counter),
            None => None,
        };
        if valid.is_none() {
            inner.tags.remove(&addr);
        }
        Ok(valid)
    }

    /// Drop the tag for the handle's value
    pub fn clear_tag(&self, h: GuestHandle) -> VmResult<()> {
        self.check(h)?;
        let v = self.inner.borrow().handles.shadow_value(h.slot);
        if let Some(addr) = v.and_then(|v| v.heap_addr()) {
            self.inner.borrow_mut().tags.remove(&addr);
        }
        Ok(())
    }

    // ---- builtins ----

    fn native_value(name: &str, f: NativeFn) -> GuestValue {
        GuestValue::Object(object_ref(GuestObject::function(FunctionData {
            name: Rc::from(name),
            imp: FnImpl::Native(f),
        })))
    }

    fn install_builtins(&self) {
        let (global, error_proto, promise_proto) = {
            let inner = self.inner.borrow();
            (
                inner.global.clone(),
                inner.intrinsics.error_proto.clone(),
                inner.intrinsics.promise_proto.clone(),
            )
        };

        // Math
        let math = object_ref(GuestObject::plain());
        math.borrow_mut().set_data(
            PropertyKey::string("floor"),
            Self::native_value(
                "floor",
                Rc::new(|vm: &Vm, call: NativeCall| {
                    let n = call
                        .args
                        .first()
                        .map(|h| vm.as_number(*h))
                        .transpose()?
                        .flatten()
                        .unwrap_or(f64::NAN);
                    Ok(vm.new_number(n.floor()))
                }),
            ),
        );
        math.borrow_mut().set_data(
            PropertyKey::string("abs"),
            Self::native_value(
                "abs",
                Rc::new(|vm: &Vm, call: NativeCall| {
                    let n = call
                        .args
                        .first()
                        .map(|h| vm.as_number(*h))
                        .transpose()?
                        .flatten()
                        .unwrap_or(f64::NAN);
                    Ok(vm.new_number(n.abs()))
                }),
            ),
        );
        global
            .borrow_mut()
            .set_data(PropertyKey::string("Math"), GuestValue::Object(math));

        // Error constructor
        let error_ctor = Self::native_value(
            "Error",
            Rc::new(|vm: &Vm, call: NativeCall| {
                let message = call
                    .args
                    .first()
                    .map(|h| vm.render(*h))
                    .transpose()?
                    .unwrap_or_default();
                Ok(vm.new_error(&message))
            }),
        );
        if let Some(ctor_obj) = error_ctor.as_object() {
            ctor_obj.borrow_mut().define(
                PropertyKey::string("prototype"),
                PropertyDescriptor::Data {
                    value: GuestValue::Object(error_proto),
                    attributes: PropertyAttributes {
                        writable: false,
                        enumerable: false,
                        configurable: false,
                    },
                },
            );
        }
        global
            .borrow_mut()
            .set_data(PropertyKey::string("Error"), error_ctor);

        // Promise.resolve / Promise.reject
        let promise_ns = object_ref(GuestObject::plain());
        promise_ns.borrow_mut().set_data(
            PropertyKey::string("resolve"),
            Self::native_value(
                "resolve",
                Rc::new(|vm: &Vm, call: NativeCall| {
                    let p = vm.new_promise();
                    match call.args.first() {
                        Some(v) => vm.resolve_promise(p, *v)?,
                        None => {
                            let u = vm.undefined();
                            vm.resolve_promise(p, u)?;
                            vm.release(u);
                        }
                    }
                    Ok(p)
                }),
            ),
        );
        promise_ns.borrow_mut().set_data(
            PropertyKey::string("reject"),
            Self::native_value(
                "reject",
                Rc::new(|vm: &Vm, call: NativeCall| {
                    let p = vm.new_promise();
                    match call.args.first() {
                        Some(v) => vm.reject_promise(p, *v)?,
                        None => {
                            let u = vm.undefined();
                            vm.reject_promise(p, u)?;
                            vm.release(u);
                        }
                    }
                    Ok(p)
                }),
            ),
        );
        global
            .borrow_mut()
            .set_data(PropertyKey::string("Promise"), GuestValue::Object(promise_ns));

        // promise.then on the promise prototype
        promise_proto.borrow_mut().set_data(
            PropertyKey::string("then"),
            Self::native_value(
                "then",
                Rc::new(|vm: &Vm, call: NativeCall| {
                    vm.promise_then(
                        call.this,
                        call.args.first().copied(),
                        call.args.get(1).copied(),
                    )?;
                    Ok(vm.undefined())
                }),
            ),
        );
    }

    /// Attach `then` callbacks to a promise handle. Terminal reactions
    /// only; no chained promise is produced.
    pub fn promise_then(
        &self,
        p: GuestHandle,
        on_fulfilled: Option<GuestHandle>,
        on_rejected: Option<GuestHandle>,
    ) -> VmResult<()> {
        let pv = self.value(p)?;
        let resolve_cb = |h: Option<GuestHandle>| -> VmResult<Option<GuestValue>> {
            match h {
                Some(h) => {
                    let v = self.value(h)?;
                    Ok(match v {
                        GuestValue::Undefined | GuestValue::Null => None,
                        other => Some(other),
                    })
                }
                None => Ok(None),
            }
        };
        let on_ok = resolve_cb(on_fulfilled)?;
        let on_err = resolve_cb(on_rejected)?;
        let Some(obj) = pv.as_object() else {
            return Err(VmError::type_error("then on non-promise"));
        };
        let mut job = None;
        {
            let mut b = obj.borrow_mut();
            let ObjectKind::Promise(data) = &mut b.kind else {
                return Err(VmError::type_error("then on non-promise"));
            };
            match &data.state {
                PromiseState::Pending => data.reactions.push(Reaction {
                    on_fulfilled: on_ok,
                    on_rejected: on_err,
                }),
                PromiseState::Fulfilled(v) => {
                    if let Some(cb) = on_ok {
                        job = Some(Job {
                            callback: cb,
                            argument: v.clone(),
                        });
                    }
                }
                PromiseState::Rejected(v) => {
                    if let Some(cb) = on_err {
                        job = Some(Job {
                            callback: cb,
                            argument: v.clone(),
                        });
                    }
                }
            }
        }
        if let Some(job) = job {
            self.inner.borrow_mut().jobs.push_back(job);
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_literal() {
        let vm = Vm::new();
        let h = vm.eval_code("1 + 2").unwrap();
        assert_eq!(vm.as_number(h).unwrap(), Some(3.0));
        vm.release(h);
    }

    #[test]
    fn test_eval_object_and_props() {
        let vm = Vm::new();
        let h = vm.eval_code("a = { x: 1, y: 'two' }; a").unwrap();
        let x = vm.get_prop(h, &PropertyKey::string("x")).unwrap();
        assert_eq!(vm.as_number(x).unwrap(), Some(1.0));
        let y = vm.get_prop(h, &PropertyKey::string("y")).unwrap();
        assert_eq!(vm.as_string(y).unwrap(), Some("two".into()));
    }

    #[test]
    fn test_eval_reference_error_becomes_exception() {
        let vm = Vm::new();
        let err = vm.eval_code("missing").unwrap_err();
        match err {
            VmError::Exception { message, .. } => {
                assert!(message.contains("missing"));
            }
            other => panic!("expected exception, got {other}"),
        }
    }

    #[test]
    fn test_throw_surfaces_value() {
        let vm = Vm::new();
        let err = vm.eval_code("throw new Error('boom')").unwrap_err();
        match err {
            VmError::Exception { handle, message } => {
                assert!(message.contains("boom"));
                assert!(vm.is_alive(handle));
                vm.release(handle);
            }
            other => panic!("expected exception, got {other}"),
        }
    }

    #[test]
    fn test_call_script_function() {
        let vm = Vm::new();
        let f = vm.eval_code("(a, b) => a * b").unwrap();
        let x = vm.new_number(6.0);
        let y = vm.new_number(7.0);
        let this = vm.undefined();
        let r = vm.call_function(f, this, &[x, y]).unwrap();
        assert_eq!(vm.as_number(r).unwrap(), Some(42.0));
    }

    #[test]
    fn test_native_function_and_this() {
        let vm = Vm::new();
        let f = vm.new_function(
            "getX",
            Rc::new(|vm: &Vm, call: NativeCall| vm.get_prop(call.this, &PropertyKey::string("x"))),
        );
        vm.set_global("getX", f).unwrap();
        let obj = vm.eval_code("o = { x: 9, m: undefined }; o.m = getX; o.m()").unwrap();
        assert_eq!(vm.as_number(obj).unwrap(), Some(9.0));
    }

    #[test]
    fn test_construct_links_prototype() {
        let vm = Vm::new();
        vm.eval_code("Point = (x) => { globalThis.lastX = x; }").unwrap();
        let ctor = vm.eval_code("Point").unwrap();
        let proto = vm.new_object();
        let desc = GuestPropertyDescriptor {
            value: Some(proto),
            get: None,
            set: None,
            attributes: PropertyAttributes::data(),
        };
        vm.define_prop(ctor, PropertyKey::string("prototype"), &desc)
            .unwrap();
        let arg = vm.new_number(5.0);
        let inst = vm.construct(ctor, &[arg]).unwrap();
        assert!(vm.instance_of(inst, ctor).unwrap());
        let last = vm.eval_code("lastX").unwrap();
        assert_eq!(vm.as_number(last).unwrap(), Some(5.0));
    }

    #[test]
    fn test_accessor_dispatch() {
        let vm = Vm::new();
        let obj = vm.new_object();
        let getter = vm.new_function(
            "get",
            Rc::new(|vm: &Vm, _call: NativeCall| Ok(vm.new_number(11.0))),
        );
        let desc = GuestPropertyDescriptor {
            value: None,
            get: Some(getter),
            set: None,
            attributes: PropertyAttributes::data(),
        };
        vm.define_prop(obj, PropertyKey::string("k"), &desc).unwrap();
        let v = vm.get_prop(obj, &PropertyKey::string("k")).unwrap();
        assert_eq!(vm.as_number(v).unwrap(), Some(11.0));
    }

    #[test]
    fn test_proxy_get_trap() {
        let vm = Vm::new();
        let target = vm.new_object();
        let one = vm.new_number(1.0);
        vm.set_prop(target, PropertyKey::string("a"), one).unwrap();
        let trap = vm.new_function(
            "get",
            Rc::new(|vm: &Vm, _call: NativeCall| Ok(vm.new_string("trapped"))),
        );
        let proxy = vm
            .new_proxy(
                target,
                ProxyTrapHandles {
                    get: Some(trap),
                    ..Default::default()
                },
            )
            .unwrap();
        let v = vm.get_prop(proxy, &PropertyKey::string("a")).unwrap();
        assert_eq!(vm.as_string(v).unwrap(), Some("trapped".into()));
        // untapped operations fall through to the target
        assert!(vm.own_keys(proxy).unwrap().len() == 1);
    }

    #[test]
    fn test_promise_then_runs_on_drain() {
        let vm = Vm::new();
        let p = vm.new_promise();
        vm.set_global("p", p).unwrap();
        vm.eval_code("p.then((v) => { globalThis.got = v; })").unwrap();
        let v = vm.new_number(3.0);
        vm.resolve_promise(p, v).unwrap();
        let got_before = vm.eval_code("globalThis.got").unwrap();
        assert_eq!(vm.type_of(got_before).unwrap(), "undefined");
        assert_eq!(vm.execute_pending_jobs(None).unwrap(), 1);
        let got = vm.eval_code("got").unwrap();
        assert_eq!(vm.as_number(got).unwrap(), Some(3.0));
    }

    #[test]
    fn test_promise_already_settled_then() {
        let vm = Vm::new();
        vm.eval_code("Promise.resolve(7).then((v) => { globalThis.got = v; })")
            .unwrap();
        assert_eq!(vm.execute_pending_jobs(None).unwrap(), 1);
        let got = vm.eval_code("got").unwrap();
        assert_eq!(vm.as_number(got).unwrap(), Some(7.0));
    }

    #[test]
    fn test_job_limit() {
        let vm = Vm::new();
        vm.eval_code(
            "Promise.resolve(1).then((v) => { globalThis.a = v; }); \
             Promise.resolve(2).then((v) => { globalThis.b = v; })",
        )
        .unwrap();
        assert_eq!(vm.execute_pending_jobs(Some(1)).unwrap(), 1);
        assert!(vm.has_pending_jobs());
        assert_eq!(vm.execute_pending_jobs(None).unwrap(), 1);
        assert!(!vm.has_pending_jobs());
    }

    #[test]
    fn test_tags_survive_handle_release() {
        let vm = Vm::new();
        let obj = vm.eval_code("keep = {}; keep").unwrap();
        vm.set_tag(obj, 41).unwrap();
        vm.release(obj);
        // still reachable from the global, so the weak tag resolves
        assert_eq!(vm.tag_of(obj).unwrap(), Some(41));
    }

    #[test]
    fn test_tag_gone_after_collection() {
        let vm = Vm::new();
        let obj = vm.new_object();
        vm.set_tag(obj, 9).unwrap();
        vm.release(obj);
        assert_eq!(vm.tag_of(obj).unwrap(), None);
    }

    #[test]
    fn test_wrong_vm_handle_rejected() {
        let a = Vm::new();
        let b = Vm::new();
        let h = a.new_number(1.0);
        assert!(matches!(b.as_number(h), Err(VmError::WrongVm)));
    }

    #[test]
    fn test_readonly_write_rejected() {
        let vm = Vm::new();
        let obj = vm.new_object();
        let v = vm.new_number(1.0);
        let desc = GuestPropertyDescriptor {
            value: Some(v),
            get: None,
            set: None,
            attributes: PropertyAttributes {
                writable: false,
                enumerable: true,
                configurable: true,
            },
        };
        vm.define_prop(obj, PropertyKey::string("k"), &desc).unwrap();
        let two = vm.new_number(2.0);
        assert!(!vm.set_prop(obj, PropertyKey::string("k"), two).unwrap());
    }
}
