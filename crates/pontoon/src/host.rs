//! Host-side dynamic value model
//!
//! The bridge needs a host heap it can traverse and mutate generically:
//! values with identity, objects with full property descriptors and
//! prototypes, callables with an explicit class capability flag, unique
//! symbols, and synchronously-settled promises. Interception works
//! through explicit accessor methods: a proxy-kind object routes
//! `get`/`set`/`delete` through a handler trait object, which is how the
//! sync layer observes mutations.

use indexmap::IndexMap;
use pontoon_vm::PropertyAttributes;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::error::{BridgeError, BridgeResult};

/// A host function: `this` plus positional arguments
pub type HostFn = Rc<dyn Fn(HostValue, &[HostValue]) -> BridgeResult<HostValue>>;

/// A settlement continuation attached to a [`HostPromise`]
pub type HostReaction = Rc<dyn Fn(&HostValue) -> BridgeResult<()>>;

/// A unique host symbol. Identity is the allocation; the description is
/// informational and crosses the bridge.
#[derive(Clone)]
pub struct HostSymbol(Rc<SymbolInner>);

pub(crate) struct SymbolInner {
    description: Option<String>,
}

impl HostSymbol {
    /// Create a symbol
    pub fn new(description: Option<&str>) -> Self {
        Self(Rc::new(SymbolInner {
            description: description.map(str::to_string),
        }))
    }

    /// The description, if any
    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    /// Identity comparison
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    fn render(&self) -> String {
        match self.description() {
            Some(d) => format!("Symbol({d})"),
            None => "Symbol()".into(),
        }
    }
}

/// Property key on the host side
#[derive(Clone)]
pub enum HostKey {
    /// String key
    String(Rc<str>),
    /// Integer index
    Index(u32),
    /// Symbol key, compared by identity
    Symbol(HostSymbol),
}

impl HostKey {
    /// Create a string key
    pub fn string(s: &str) -> Self {
        Self::String(Rc::from(s))
    }

    /// Render for messages
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.to_string(),
            Self::Index(i) => i.to_string(),
            Self::Symbol(s) => s.render(),
        }
    }

    /// Whether this is the string key `__proto__`
    pub fn is_proto_key(&self) -> bool {
        matches!(self, Self::String(s) if &**s == "__proto__")
    }
}

impl PartialEq for HostKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Index(a), Self::Index(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a.same(b),
            _ => false,
        }
    }
}

impl Eq for HostKey {}

impl Hash for HostKey {
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
                s.ptr_id().hash(state);
            }
        }
    }
}

/// Host property descriptor, either data or accessor
#[derive(Clone)]
pub enum HostDescriptor {
    /// Data property
    Data {
        /// The value
        value: HostValue,
        /// Attributes
        attributes: PropertyAttributes,
    },
    /// Accessor property
    Accessor {
        /// Getter (callable)
        get: Option<HostValue>,
        /// Setter (callable)
        set: Option<HostValue>,
        /// Attributes
        attributes: PropertyAttributes,
    },
}

impl HostDescriptor {
    /// Data descriptor with default attributes
    pub fn data(value: HostValue) -> Self {
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

/// Interception handler for proxy-kind host objects. The sync layer is
/// the only producer of these.
pub trait HostProxyHandler {
    /// Intercepted read
    fn get(&self, target: &HostObject, key: &HostKey) -> BridgeResult<HostValue>;
    /// Intercepted write; false means the write was rejected
    fn set(&self, target: &HostObject, key: HostKey, value: HostValue) -> BridgeResult<bool>;
    /// Intercepted delete
    fn delete(&self, target: &HostObject, key: &HostKey) -> BridgeResult<bool>;
}

enum HostKind {
    Plain,
    Array,
    Error,
    Proxy {
        target: HostObject,
        handler: Rc<dyn HostProxyHandler>,
    },
}

struct HostCallable {
    name: Rc<str>,
    is_class: bool,
    func: HostFn,
    construct: Option<HostFn>,
}

pub(crate) struct ObjectInner {
    props: IndexMap<HostKey, HostDescriptor>,
    proto: Option<HostValue>,
    kind: HostKind,
    call: Option<HostCallable>,
}

/// A host object: shared, mutable, identity-bearing
#[derive(Clone)]
pub struct HostObject(Rc<RefCell<ObjectInner>>);

impl HostObject {
    fn from_inner(inner: ObjectInner) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }

    /// An empty plain object
    pub fn new() -> Self {
        Self::from_inner(ObjectInner {
            props: IndexMap::new(),
            proto: None,
            kind: HostKind::Plain,
            call: None,
        })
    }

    /// An empty array
    pub fn array() -> Self {
        let obj = Self::new();
        obj.0.borrow_mut().kind = HostKind::Array;
        obj
    }

    /// An error object carrying a message
    pub fn error(message: &str) -> Self {
        let obj = Self::new();
        obj.0.borrow_mut().kind = HostKind::Error;
        obj.define(
            HostKey::string("name"),
            HostDescriptor::data(HostValue::from("Error")),
        );
        obj.define(
            HostKey::string("message"),
            HostDescriptor::data(HostValue::from(message)),
        );
        obj
    }

    /// A callable object with a fresh `prototype` object carrying a
    /// `constructor` back-reference
    pub fn function(name: &str, func: HostFn) -> Self {
        Self::callable(name, func, false)
    }

    /// A class constructor. The capability flag is set here, at creation;
    /// class-ness is never re-derived from the callable itself. The
    /// constructor body runs with a fresh instance as `this` when
    /// constructed; calling it without construction is an error.
    pub fn class_constructor(name: &str, func: HostFn) -> Self {
        Self::callable(name, func, true)
    }

    /// A callable whose construction behavior is supplied separately.
    /// Used for mirrors of foreign functions where `new` must be replayed
    /// on the original rather than run against a local instance.
    pub(crate) fn bridged(name: &str, func: HostFn, construct: HostFn) -> Self {
        Self::callable_inner(name, func, false, Some(construct))
    }

    fn callable(name: &str, func: HostFn, is_class: bool) -> Self {
        Self::callable_inner(name, func, is_class, None)
    }

    fn callable_inner(
        name: &str,
        func: HostFn,
        is_class: bool,
        construct: Option<HostFn>,
    ) -> Self {
        let obj = Self::from_inner(ObjectInner {
            props: IndexMap::new(),
            proto: None,
            kind: HostKind::Plain,
            call: Some(HostCallable {
                name: Rc::from(name),
                is_class,
                func,
                construct,
            }),
        });
        let proto = HostObject::new();
        proto.define(
            HostKey::string("constructor"),
            HostDescriptor::Data {
                value: HostValue::Object(obj.clone()),
                attributes: PropertyAttributes {
                    writable: true,
                    enumerable: false,
                    configurable: true,
                },
            },
        );
        obj.define(
            HostKey::string("prototype"),
            HostDescriptor::Data {
                value: HostValue::Object(proto),
                attributes: PropertyAttributes {
                    writable: true,
                    enumerable: false,
                    configurable: false,
                },
            },
        );
        obj
    }

    /// A proxy around `target` routing property operations through
    /// `handler`
    pub fn proxy(target: HostObject, handler: Rc<dyn HostProxyHandler>) -> Self {
        Self::from_inner(ObjectInner {
            props: IndexMap::new(),
            proto: None,
            kind: HostKind::Proxy { target, handler },
            call: None,
        })
    }

    /// Identity comparison
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Whether this object is an array
    pub fn is_array(&self) -> bool {
        matches!(self.0.borrow().kind, HostKind::Array)
    }

    /// Whether this object is an error object
    pub fn is_error(&self) -> bool {
        matches!(self.0.borrow().kind, HostKind::Error)
    }

    /// Whether this object is a proxy
    pub fn is_proxy(&self) -> bool {
        matches!(self.0.borrow().kind, HostKind::Proxy { .. })
    }

    /// The proxy target, if this is a proxy
    pub fn proxy_target(&self) -> Option<HostObject> {
        match &self.0.borrow().kind {
            HostKind::Proxy { target, .. } => Some(target.clone()),
            _ => None,
        }
    }

    /// Whether this object can be called
    pub fn is_callable(&self) -> bool {
        let inner = self.0.borrow();
        match &inner.kind {
            HostKind::Proxy { target, .. } => {
                let target = target.clone();
                drop(inner);
                target.is_callable()
            }
            _ => inner.call.is_some(),
        }
    }

    /// Whether this callable carries the class capability flag
    pub fn is_class(&self) -> bool {
        let inner = self.0.borrow();
        match &inner.kind {
            HostKind::Proxy { target, .. } => {
                let target = target.clone();
                drop(inner);
                target.is_class()
            }
            _ => inner.call.as_ref().map(|c| c.is_class).unwrap_or(false),
        }
    }

    /// Callable name (empty for anonymous or non-callables)
    pub fn name(&self) -> String {
        self.0
            .borrow()
            .call
            .as_ref()
            .map(|c| c.name.to_string())
            .unwrap_or_default()
    }

    /// Read a property through accessors, the prototype chain, and proxy
    /// handlers
    pub fn get(&self, key: &HostKey) -> BridgeResult<HostValue> {
        self.get_with(key, &HostValue::Object(self.clone()))
    }

    fn get_with(&self, key: &HostKey, receiver: &HostValue) -> BridgeResult<HostValue> {
        let dispatch = {
            let inner = self.0.borrow();
            match &inner.kind {
                HostKind::Proxy { target, handler } => {
                    Some((target.clone(), handler.clone()))
                }
                _ => None,
            }
        };
        if let Some((target, handler)) = dispatch {
            return handler.get(&target, key);
        }

        let own = self.0.borrow().props.get(key).cloned();
        match own {
            Some(HostDescriptor::Data { value, .. }) => Ok(value),
            Some(HostDescriptor::Accessor { get: Some(g), .. }) => {
                call_value(&g, receiver.clone(), &[])
            }
            Some(HostDescriptor::Accessor { get: None, .. }) => Ok(HostValue::Undefined),
            None => {
                let proto = self.0.borrow().proto.clone();
                match proto {
                    Some(HostValue::Object(p)) => p.get_with(key, receiver),
                    _ => Ok(HostValue::Undefined),
                }
            }
        }
    }

    /// Write a property; accessors and proxy handlers dispatch, read-only
    /// data properties reject
    pub fn set(&self, key: HostKey, value: HostValue) -> BridgeResult<bool> {
        let dispatch = {
            let inner = self.0.borrow();
            match &inner.kind {
                HostKind::Proxy { target, handler } => Some((target.clone(), handler.clone())),
                _ => None,
            }
        };
        if let Some((target, handler)) = dispatch {
            return handler.set(&target, key, value);
        }

        let receiver = HostValue::Object(self.clone());
        let mut cur = self.clone();
        loop {
            let own = cur.0.borrow().props.get(&key).cloned();
            match own {
                Some(HostDescriptor::Accessor { set: Some(s), .. }) => {
                    call_value(&s, receiver, &[value])?;
                    return Ok(true);
                }
                Some(HostDescriptor::Accessor { set: None, .. }) => return Ok(false),
                Some(HostDescriptor::Data { attributes, .. }) => {
                    if !attributes.writable {
                        return Ok(false);
                    }
                    break;
                }
                None => {
                    let proto = cur.0.borrow().proto.clone();
                    match proto {
                        Some(HostValue::Object(p)) => cur = p,
                        _ => break,
                    }
                }
            }
        }
        self.0
            .borrow_mut()
            .props
            .insert(key, HostDescriptor::data(value));
        Ok(true)
    }

    /// Delete an own property; non-configurable properties reject
    pub fn delete(&self, key: &HostKey) -> BridgeResult<bool> {
        let dispatch = {
            let inner = self.0.borrow();
            match &inner.kind {
                HostKind::Proxy { target, handler } => Some((target.clone(), handler.clone())),
                _ => None,
            }
        };
        if let Some((target, handler)) = dispatch {
            return handler.delete(&target, key);
        }

        let mut inner = self.0.borrow_mut();
        if let Some(desc) = inner.props.get(key) {
            if !desc.attributes().configurable {
                return Ok(false);
            }
            inner.props.shift_remove(key);
        }
        Ok(true)
    }

    /// Define or replace an own property without attribute checks.
    /// Proxies define on their target.
    pub fn define(&self, key: HostKey, desc: HostDescriptor) {
        let target = self.proxy_target();
        match target {
            Some(t) => t.define(key, desc),
            None => {
                self.0.borrow_mut().props.insert(key, desc);
            }
        }
    }

    /// Own property descriptor (proxies read their target)
    pub fn own_descriptor(&self, key: &HostKey) -> Option<HostDescriptor> {
        match self.proxy_target() {
            Some(t) => t.own_descriptor(key),
            None => self.0.borrow().props.get(key).cloned(),
        }
    }

    /// Own keys in definition order (proxies enumerate their target)
    pub fn own_keys(&self) -> Vec<HostKey> {
        match self.proxy_target() {
            Some(t) => t.own_keys(),
            None => self.0.borrow().props.keys().cloned().collect(),
        }
    }

    /// Whether an own property exists
    pub fn has_own(&self, key: &HostKey) -> bool {
        match self.proxy_target() {
            Some(t) => t.has_own(key),
            None => self.0.borrow().props.contains_key(key),
        }
    }

    /// The explicit prototype, if set
    pub fn proto(&self) -> Option<HostValue> {
        match self.proxy_target() {
            Some(t) => t.proto(),
            None => self.0.borrow().proto.clone(),
        }
    }

    /// Set the prototype
    pub fn set_proto(&self, proto: HostValue) {
        match self.proxy_target() {
            Some(t) => t.set_proto(proto),
            None => self.0.borrow_mut().proto = Some(proto),
        }
    }

    /// Append an array element
    pub fn push(&self, value: HostValue) {
        let idx = self
            .own_keys()
            .iter()
            .filter(|k| matches!(k, HostKey::Index(_)))
            .count() as u32;
        self.define(HostKey::Index(idx), HostDescriptor::data(value));
    }

    /// Invoke the callable with an explicit `this`
    pub fn call(&self, this: HostValue, args: &[HostValue]) -> BridgeResult<HostValue> {
        if let Some(t) = self.proxy_target() {
            return t.call(this, args);
        }
        let callable = {
            let inner = self.0.borrow();
            match &inner.call {
                Some(c) => {
                    if c.is_class {
                        return Err(BridgeError::host(format!(
                            "class constructor {} cannot be invoked without new",
                            c.name
                        )));
                    }
                    c.func.clone()
                }
                None => {
                    return Err(BridgeError::host(format!(
                        "{} is not a function",
                        HostValue::Object(self.clone()).render()
                    )));
                }
            }
        };
        callable(this, args)
    }

    /// Construct an instance: allocate `this` with the callable's
    /// `prototype` property, run the body, and return the explicit object
    /// result or the instance
    pub fn construct(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        if let Some(t) = self.proxy_target() {
            return t.construct(args);
        }
        let (func, construct) = {
            let inner = self.0.borrow();
            match &inner.call {
                Some(c) => (c.func.clone(), c.construct.clone()),
                None => {
                    return Err(BridgeError::host(format!(
                        "{} is not a constructor",
                        HostValue::Object(self.clone()).render()
                    )));
                }
            }
        };
        if let Some(construct) = construct {
            return construct(HostValue::Undefined, args);
        }
        let instance = HostObject::new();
        if let HostValue::Object(p) = self.get(&HostKey::string("prototype"))? {
            instance.set_proto(HostValue::Object(p));
        }
        let instance_v = HostValue::Object(instance);
        let result = func(instance_v.clone(), args)?;
        if matches!(result, HostValue::Object(_)) {
            Ok(result)
        } else {
            Ok(instance_v)
        }
    }

    /// Whether `self` sits on the prototype chain of `value`
    pub fn instance_of(&self, value: &HostValue) -> BridgeResult<bool> {
        let proto = match self.get(&HostKey::string("prototype"))? {
            HostValue::Object(p) => p,
            _ => return Ok(false),
        };
        let mut cur = value.clone();
        loop {
            let Some(obj) = cur.as_object() else {
                return Ok(false);
            };
            match obj.proto() {
                Some(HostValue::Object(p)) => {
                    if p.same(&proto) {
                        return Ok(true);
                    }
                    cur = HostValue::Object(p);
                }
                _ => return Ok(false),
            }
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ObjectInner>> {
        Rc::downgrade(&self.0)
    }
}

impl Default for HostObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Call a host value as a function
pub fn call_value(f: &HostValue, this: HostValue, args: &[HostValue]) -> BridgeResult<HostValue> {
    match f {
        HostValue::Object(o) if o.is_callable() => o.call(this, args),
        other => Err(BridgeError::host(format!(
            "{} is not a function",
            other.render()
        ))),
    }
}

/// Promise settlement state
enum HostPromiseState {
    Pending,
    Fulfilled(HostValue),
    Rejected(HostValue),
}

pub(crate) struct PromiseInner {
    state: HostPromiseState,
    reactions: Vec<(Option<HostReaction>, Option<HostReaction>)>,
}

/// A host promise with external resolve/reject. Settlement runs
/// continuations synchronously; the host side has no job queue.
#[derive(Clone)]
pub struct HostPromise(Rc<RefCell<PromiseInner>>);

impl HostPromise {
    /// A fresh pending promise
    pub fn deferred() -> Self {
        Self(Rc::new(RefCell::new(PromiseInner {
            state: HostPromiseState::Pending,
            reactions: Vec::new(),
        })))
    }

    /// Identity comparison
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Whether the promise is still pending
    pub fn is_pending(&self) -> bool {
        matches!(self.0.borrow().state, HostPromiseState::Pending)
    }

    /// Resolve; attached fulfillment continuations run now. Settling
    /// twice is a no-op.
    pub fn resolve(&self, value: HostValue) -> BridgeResult<()> {
        self.settle(value, true)
    }

    /// Reject; attached rejection continuations run now
    pub fn reject(&self, reason: HostValue) -> BridgeResult<()> {
        self.settle(reason, false)
    }

    fn settle(&self, value: HostValue, fulfill: bool) -> BridgeResult<()> {
        let reactions = {
            let mut inner = self.0.borrow_mut();
            if !matches!(inner.state, HostPromiseState::Pending) {
                return Ok(());
            }
            inner.state = if fulfill {
                HostPromiseState::Fulfilled(value.clone())
            } else {
                HostPromiseState::Rejected(value.clone())
            };
            std::mem::take(&mut inner.reactions)
        };
        for (on_fulfilled, on_rejected) in reactions {
            let cb = if fulfill { on_fulfilled } else { on_rejected };
            if let Some(cb) = cb {
                cb(&value)?;
            }
        }
        Ok(())
    }

    /// Attach continuations; an already-settled promise runs the matching
    /// one immediately
    pub fn then(
        &self,
        on_fulfilled: Option<HostReaction>,
        on_rejected: Option<HostReaction>,
    ) -> BridgeResult<()> {
        let settled = {
            let inner = self.0.borrow();
            match &inner.state {
                HostPromiseState::Pending => None,
                HostPromiseState::Fulfilled(v) => Some((v.clone(), true)),
                HostPromiseState::Rejected(v) => Some((v.clone(), false)),
            }
        };
        match settled {
            None => {
                self.0
                    .borrow_mut()
                    .reactions
                    .push((on_fulfilled, on_rejected));
                Ok(())
            }
            Some((v, fulfilled)) => {
                let cb = if fulfilled { on_fulfilled } else { on_rejected };
                match cb {
                    Some(cb) => cb(&v),
                    None => Ok(()),
                }
            }
        }
    }
}

/// A host value
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Symbol(HostSymbol),
    Object(HostObject),
    Promise(HostPromise),
}

impl HostValue {
    /// Is `undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Object payload, if object
    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Whether this value participates in identity tracking
    pub fn is_identity_bearing(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Symbol(_) | Self::Promise(_))
    }

    /// Stable pointer id for identity-bearing values
    pub(crate) fn ptr_id(&self) -> Option<usize> {
        match self {
            Self::Object(o) => Some(o.ptr_id()),
            Self::Symbol(s) => Some(s.ptr_id()),
            Self::Promise(p) => Some(p.ptr_id()),
            _ => None,
        }
    }

    /// Strict identity: primitives by value, the rest by pointer
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a.same(b),
            (Self::Object(a), Self::Object(b)) => a.same(b),
            (Self::Promise(a), Self::Promise(b)) => a.same(b),
            _ => false,
        }
    }

    /// Best-effort rendering for messages
    pub fn render(&self) -> String {
        match self {
            Self::Undefined => "undefined".into(),
            Self::Null => "null".into(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Self::String(s) => s.to_string(),
            Self::Symbol(s) => s.render(),
            Self::Object(o) => {
                if o.is_error() {
                    let msg = o
                        .own_descriptor(&HostKey::string("message"))
                        .and_then(|d| match d {
                            HostDescriptor::Data { value, .. } => Some(value.render()),
                            HostDescriptor::Accessor { .. } => None,
                        })
                        .unwrap_or_default();
                    format!("Error: {msg}")
                } else if o.is_callable() {
                    format!("[function {}]", o.name())
                } else if o.is_array() {
                    "[array]".into()
                } else {
                    "[object Object]".into()
                }
            }
            Self::Promise(_) => "[object Promise]".into(),
        }
    }
}

impl std::fmt::Debug for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(Rc::from(s))
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Weak reference to an identity-bearing host value; used by the
/// identity map so registration never keeps host values alive
pub(crate) enum HostWeakValue {
    Object(Weak<RefCell<ObjectInner>>),
    Symbol(Weak<SymbolInner>),
    Promise(Weak<RefCell<PromiseInner>>),
}

impl HostWeakValue {
    pub(crate) fn downgrade(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Object(o) => Some(Self::Object(o.downgrade())),
            HostValue::Symbol(s) => Some(Self::Symbol(Rc::downgrade(&s.0))),
            HostValue::Promise(p) => Some(Self::Promise(Rc::downgrade(&p.0))),
            _ => None,
        }
    }

    pub(crate) fn upgrade(&self) -> Option<HostValue> {
        match self {
            Self::Object(w) => w.upgrade().map(|rc| HostValue::Object(HostObject(rc))),
            Self::Symbol(w) => w.upgrade().map(|rc| HostValue::Symbol(HostSymbol(rc))),
            Self::Promise(w) => w.upgrade().map(|rc| HostValue::Promise(HostPromise(rc))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_get_set() {
        let obj = HostObject::new();
        assert!(obj.set(HostKey::string("a"), HostValue::from(1.0)).unwrap());
        let got = obj.get(&HostKey::string("a")).unwrap();
        assert!(got.same_value(&HostValue::from(1.0)));
    }

    #[test]
    fn test_readonly_rejects() {
        let obj = HostObject::new();
        obj.define(
            HostKey::string("k"),
            HostDescriptor::Data {
                value: HostValue::from(1.0),
                attributes: PropertyAttributes {
                    writable: false,
                    enumerable: true,
                    configurable: true,
                },
            },
        );
        assert!(!obj.set(HostKey::string("k"), HostValue::from(2.0)).unwrap());
    }

    #[test]
    fn test_accessor_get() {
        let obj = HostObject::new();
        let getter = HostObject::function("get", Rc::new(|_, _| Ok(HostValue::from(5.0))));
        obj.define(
            HostKey::string("x"),
            HostDescriptor::Accessor {
                get: Some(HostValue::Object(getter)),
                set: None,
                attributes: PropertyAttributes::data(),
            },
        );
        assert!(obj
            .get(&HostKey::string("x"))
            .unwrap()
            .same_value(&HostValue::from(5.0)));
    }

    #[test]
    fn test_prototype_chain_get() {
        let proto = HostObject::new();
        proto
            .set(HostKey::string("inherited"), HostValue::from(7.0))
            .unwrap();
        let obj = HostObject::new();
        obj.set_proto(HostValue::Object(proto));
        assert!(obj
            .get(&HostKey::string("inherited"))
            .unwrap()
            .same_value(&HostValue::from(7.0)));
    }

    #[test]
    fn test_construct_links_prototype_and_fields() {
        let class = HostObject::class_constructor(
            "Point",
            Rc::new(|this, args| {
                if let HostValue::Object(o) = &this {
                    o.set(HostKey::string("x"), args[0].clone())?;
                }
                Ok(HostValue::Undefined)
            }),
        );
        let instance = class.construct(&[HostValue::from(3.0)]).unwrap();
        assert!(class.instance_of(&instance).unwrap());
        let obj = instance.as_object().unwrap();
        assert!(obj
            .get(&HostKey::string("x"))
            .unwrap()
            .same_value(&HostValue::from(3.0)));
    }

    #[test]
    fn test_class_call_without_new_fails() {
        let class = HostObject::class_constructor("C", Rc::new(|_, _| Ok(HostValue::Undefined)));
        assert!(class.call(HostValue::Undefined, &[]).is_err());
    }

    #[test]
    fn test_promise_then_after_resolve() {
        let p = HostPromise::deferred();
        p.resolve(HostValue::from("done")).unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        p.then(
            Some(Rc::new(move |v: &HostValue| {
                *got2.borrow_mut() = Some(v.clone());
                Ok(())
            })),
            None,
        )
        .unwrap();
        assert!(got.borrow().as_ref().unwrap().same_value(&HostValue::from("done")));
    }

    #[test]
    fn test_symbol_identity() {
        let a = HostSymbol::new(Some("tag"));
        let b = HostSymbol::new(Some("tag"));
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }
}
