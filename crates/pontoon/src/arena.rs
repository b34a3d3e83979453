//! Bridge façade
//!
//! An [`Arena`] owns everything the bridge allocates against one engine
//! instance: the long-lived identity map, the registered-pair table,
//! sync registrations and the in-flight set. Disposing the arena
//! releases every guest handle the bridge holds; the engine itself
//! stays caller-owned.

use pontoon_vm::{GuestHandle, PropertyKey, Vm, VmError};
use rustc_hash::FxHashSet;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostKey, HostValue};
use crate::identity::IdentityMap;
use crate::sync::{self, SyncMode, SyncRegistry};
use crate::util::walk_object;
use crate::{marshal, transfer, unmarshal};

/// Per-value marshaling policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marshalable {
    /// Mirror by reference with identity tracking (the default)
    Reference,
    /// One-shot structural copy, no identity
    Json,
    /// Do not marshal; the guest sees `undefined`
    Deny,
}

/// A permanent identity override: the guest counterpart is either
/// evaluated from source once at registration or supplied as a handle.
pub enum Registration {
    /// Evaluate this source in the guest and bind the result
    Source(String),
    /// Bind an existing guest handle (stays caller-owned)
    Handle(GuestHandle),
}

/// Bridge configuration
#[derive(Default)]
pub struct Options {
    /// Per-value marshaling gate; `None` means everything mirrors by
    /// reference
    pub is_marshalable: Option<Rc<dyn Fn(&HostValue) -> Marshalable>>,
    /// Per-value sync discipline; consulted after explicit sync
    /// registrations
    pub sync_mode: Option<Rc<dyn Fn(&HostValue) -> Option<SyncMode>>>,
    /// Permanent identity pairs installed at construction
    pub registered: Vec<(HostValue, Registration)>,
}

pub(crate) struct Core {
    pub(crate) vm: Vm,
    pub(crate) map: RefCell<IdentityMap>,
    pub(crate) registered: RefCell<IdentityMap>,
    pub(crate) sync: RefCell<SyncRegistry>,
    pub(crate) in_flight: RefCell<FxHashSet<usize>>,
    disposed: Cell<bool>,
    is_marshalable: Option<Rc<dyn Fn(&HostValue) -> Marshalable>>,
    sync_mode: Option<Rc<dyn Fn(&HostValue) -> Option<SyncMode>>>,
}

impl Core {
    pub(crate) fn check_disposed(&self) -> BridgeResult<()> {
        if self.disposed.get() {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn marshalable(&self, value: &HostValue) -> Marshalable {
        match &self.is_marshalable {
            Some(f) => f(value),
            None => Marshalable::Reference,
        }
    }

    /// Whether the value participates in live synchronization
    pub(crate) fn sync_enabled(&self, value: &HostValue) -> bool {
        let raw = sync::unwrap_host(value);
        if self.sync.borrow_mut().mode_of(&raw).is_some() {
            return true;
        }
        match &self.sync_mode {
            Some(f) => f(&raw).is_some(),
            None => false,
        }
    }

    fn resolve_mode(&self, value: &HostValue, default: SyncMode) -> SyncMode {
        let raw = sync::unwrap_host(value);
        if let Some(id) = raw.ptr_id() {
            if self.in_flight.borrow().contains(&id) {
                return SyncMode::Both;
            }
        }
        if let Some(mode) = self.sync.borrow_mut().mode_of(&raw) {
            return mode;
        }
        if let Some(f) = &self.sync_mode {
            if let Some(mode) = f(&raw) {
                return mode;
            }
        }
        default
    }

    /// Discipline for a host-side write
    pub(crate) fn resolve_host_mode(&self, value: &HostValue) -> SyncMode {
        self.resolve_mode(value, SyncMode::Host)
    }

    /// Discipline for a guest-side write
    pub(crate) fn resolve_guest_mode(&self, value: &HostValue) -> SyncMode {
        self.resolve_mode(value, SyncMode::Vm)
    }

    /// One full host → guest traversal. The pass builds pairs in a
    /// scratch map and commits them only when the whole graph succeeds;
    /// a failed pass disposes its scratch handles instead of polluting
    /// the live table.
    pub(crate) fn marshal_root(self: &Rc<Self>, value: &HostValue) -> BridgeResult<GuestHandle> {
        self.check_disposed()?;
        let scratch = RefCell::new(self.map.borrow().scratch());
        let handle = marshal::marshal(self, &scratch, value)?;
        let mut scratch = scratch.into_inner();
        if let Err(e) = self.map.borrow_mut().merge(&mut scratch) {
            self.vm.release(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// One full guest → host traversal, same scratch-and-merge shape
    pub(crate) fn unmarshal_root(self: &Rc<Self>, handle: GuestHandle) -> BridgeResult<HostValue> {
        self.check_disposed()?;
        let scratch = RefCell::new(self.map.borrow().scratch());
        let value = unmarshal::unmarshal(self, &scratch, handle)?;
        let mut scratch = scratch.into_inner();
        self.map.borrow_mut().merge(&mut scratch)?;
        Ok(value)
    }

    pub(crate) fn guest_key(self: &Rc<Self>, key: &HostKey) -> BridgeResult<PropertyKey> {
        match key {
            HostKey::String(s) => Ok(PropertyKey::String(s.clone())),
            HostKey::Index(i) => Ok(PropertyKey::Index(*i)),
            HostKey::Symbol(_) => {
                let scratch = RefCell::new(self.map.borrow().scratch());
                let pkey = transfer::guest_key(self, &scratch, key)?;
                let mut scratch = scratch.into_inner();
                self.map.borrow_mut().merge(&mut scratch)?;
                Ok(pkey)
            }
        }
    }

    pub(crate) fn host_key(self: &Rc<Self>, key: &PropertyKey) -> BridgeResult<HostKey> {
        match key {
            PropertyKey::String(s) => Ok(HostKey::String(s.clone())),
            PropertyKey::Index(i) => Ok(HostKey::Index(*i)),
            PropertyKey::Symbol(_) => {
                let scratch = RefCell::new(self.map.borrow().scratch());
                let hkey = transfer::host_key(self, &scratch, key)?;
                let mut scratch = scratch.into_inner();
                self.map.borrow_mut().merge(&mut scratch)?;
                Ok(hkey)
            }
        }
    }

    /// Re-raise a guest failure on the host side, unmarshaling thrown
    /// values so callers see native-looking exceptions
    pub(crate) fn raise(self: &Rc<Self>, e: VmError) -> BridgeError {
        match e {
            VmError::Exception { handle, .. } => {
                let value = self.unmarshal_root(handle);
                self.vm.release(handle);
                match value {
                    Ok(v) => BridgeError::exception(v),
                    Err(inner) => inner,
                }
            }
            other => other.into(),
        }
    }
}

/// The bridge façade
pub struct Arena {
    core: Rc<Core>,
}

impl Arena {
    /// Build a bridge over an engine instance. Registered pairs from
    /// `options` are installed immediately; a source registration that
    /// fails to evaluate fails construction.
    pub fn new(vm: Vm, mut options: Options) -> BridgeResult<Self> {
        let counter = Rc::new(Cell::new(0));
        let pairs = std::mem::take(&mut options.registered);
        let core = Rc::new(Core {
            map: RefCell::new(IdentityMap::new(vm.clone(), counter.clone())),
            registered: RefCell::new(IdentityMap::new(vm.clone(), counter)),
            sync: RefCell::new(SyncRegistry::default()),
            in_flight: RefCell::new(FxHashSet::default()),
            disposed: Cell::new(false),
            is_marshalable: options.is_marshalable,
            sync_mode: options.sync_mode,
            vm,
        });
        let arena = Self { core };
        for (host, registration) in pairs {
            arena.register(&host, registration)?;
        }
        Ok(arena)
    }

    /// The underlying engine
    pub fn vm(&self) -> &Vm {
        &self.core.vm
    }

    /// Evaluate guest source and unmarshal the completion value. Guest
    /// throws surface as [`BridgeError::Exception`] carrying the
    /// unmarshaled thrown value.
    pub fn eval_code(&self, code: &str) -> BridgeResult<HostValue> {
        self.core.check_disposed()?;
        debug!(len = code.len(), "eval");
        match self.core.vm.eval_code(code) {
            Ok(h) => {
                let value = self.core.unmarshal_root(h);
                self.core.vm.release(h);
                value
            }
            Err(e) => Err(self.core.raise(e)),
        }
    }

    /// Marshal each binding and install it as a guest global
    pub fn expose<I>(&self, bindings: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = (String, HostValue)>,
    {
        self.core.check_disposed()?;
        for (name, value) in bindings {
            debug!(name = %name, "expose");
            let h = self.core.marshal_root(&value)?;
            let res = self.core.vm.set_global(&name, h);
            self.core.vm.release(h);
            res?;
        }
        Ok(())
    }

    /// Mark a value and its object-reachable closure for two-way live
    /// synchronization and return the wrapped mirror. Writes must go
    /// through the returned wrapper to be observed.
    pub fn sync(&self, value: &HostValue) -> BridgeResult<HostValue> {
        self.sync_with(value, SyncMode::Both)
    }

    /// Like [`Arena::sync`] with an explicit discipline
    pub fn sync_with(&self, value: &HostValue, mode: SyncMode) -> BridgeResult<HostValue> {
        self.core.check_disposed()?;
        {
            let mut registry = self.core.sync.borrow_mut();
            walk_object(value, &mut |v| registry.mark(v, mode));
        }
        // build (or fetch) the wrapper before attaching so the cached
        // wrapper and the mapped one are the same object
        let wrapped = sync::wrap_host(&self.core, value);
        self.ensure_wrapped(value)?;
        Ok(wrapped)
    }

    /// Clear sync registrations for a value and its reachable closure
    pub fn unsync(&self, value: &HostValue) {
        let mut registry = self.core.sync.borrow_mut();
        walk_object(value, &mut |v| registry.unmark(v));
    }

    // A value marshaled before it was marked for sync already has an
    // unwrapped guest mirror; attach the wrapped pair so future guest
    // lookups observe synchronization.
    fn ensure_wrapped(&self, value: &HostValue) -> BridgeResult<()> {
        let core = &self.core;
        let raw_host = sync::unwrap_host(value);
        let existing = core.map.borrow_mut().get_raw(&raw_host);
        let Some(raw) = existing else {
            return Ok(());
        };
        if core.vm.is_proxy(raw)? {
            return Ok(());
        }
        let already = core.map.borrow_mut().get(&raw_host);
        if let Some(h) = already {
            if core.vm.is_proxy(h)? {
                return Ok(());
            }
        }
        let wrapped_host = sync::wrap_host(core, &raw_host);
        let wrapped = sync::wrap_guest(core, &raw_host, raw)?;
        let res = core
            .map
            .borrow_mut()
            .attach_wrapped(&raw_host, &wrapped_host, wrapped);
        core.vm.release(wrapped);
        res
    }

    /// Install a permanent identity pair, consulted before either
    /// engine ever builds a mirror
    pub fn register(&self, host: &HostValue, registration: Registration) -> BridgeResult<()> {
        self.core.check_disposed()?;
        match registration {
            Registration::Source(src) => {
                let h = self.core.vm.eval_code(&src).map_err(|e| self.core.raise(e))?;
                let res = self.core.registered.borrow_mut().register(host, h);
                self.core.vm.release(h);
                res.map(|_| ())
            }
            Registration::Handle(h) => self
                .core
                .registered
                .borrow_mut()
                .register(host, h)
                .map(|_| ()),
        }
    }

    /// Remove a permanent identity pair
    pub fn unregister(&self, host: &HostValue) {
        self.core.registered.borrow_mut().delete(host);
    }

    /// Drain the guest's pending-job queue, re-raising failed jobs with
    /// their thrown value unmarshaled. Returns the number of jobs run.
    pub fn execute_pending_jobs(&self, limit: Option<usize>) -> BridgeResult<usize> {
        self.core.check_disposed()?;
        self.core
            .vm
            .execute_pending_jobs(limit)
            .map_err(|e| self.core.raise(e))
    }

    /// Release every guest handle the bridge holds. Idempotent; the
    /// engine instance stays usable.
    pub fn dispose(&self) {
        if self.core.disposed.replace(true) {
            return;
        }
        let pairs = self.core.map.borrow().size();
        self.core.map.borrow_mut().dispose();
        self.core.registered.borrow_mut().dispose();
        self.core.sync.borrow_mut().clear();
        debug!(pairs, "arena disposed");
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.dispose();
    }
}
