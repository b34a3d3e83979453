//! Live synchronization proxies
//!
//! A synchronized value is wrapped on both sides: the host side gets a
//! proxy-kind [`HostObject`] whose handler replays writes into the
//! guest, and the guest side gets an engine proxy whose native traps
//! replay writes back to the host. Reads are always served locally.
//! Which side a write commits to is decided per value by its
//! [`SyncMode`]:
//!
//! - `Both`: apply locally first; if the local write is rejected the
//!   operation is abandoned, otherwise it is replayed on the
//!   counterpart.
//! - `Vm`: the guest copy is authoritative. Host-side writes are not
//!   applied locally and only replayed into the guest; guest-side
//!   writes stay local.
//! - `Host`: the host copy is authoritative, mirrored rules.
//!
//! `__proto__` writes are rejected outright in both directions.

use pontoon_vm::{GuestHandle, NativeCall, PropertyKey, ProxyTrapHandles, Vm, VmError, VmResult};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use tracing::trace;

use crate::arena::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostKey, HostObject, HostProxyHandler, HostValue, HostWeakValue};
use crate::marshal;

/// Synchronization discipline for a live value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Mutations on either side propagate to the other
    Both,
    /// The guest copy is authoritative
    Vm,
    /// The host copy is authoritative
    Host,
}

/// Per-value sync registrations and the wrapper cache. Keys are host
/// pointer ids; mode entries hold weak references and are validated on
/// read so a reused address never resurrects a stale registration.
/// Wrappers are held strongly: identity lookups must keep returning the
/// same wrapper for as long as the arena lives.
#[derive(Default)]
pub(crate) struct SyncRegistry {
    modes: FxHashMap<usize, (HostWeakValue, SyncMode)>,
    wrappers: FxHashMap<usize, HostValue>,
}

impl SyncRegistry {
    pub(crate) fn mark(&mut self, value: &HostValue, mode: SyncMode) {
        let (Some(id), Some(weak)) = (value.ptr_id(), HostWeakValue::downgrade(value)) else {
            return;
        };
        self.modes.insert(id, (weak, mode));
    }

    pub(crate) fn unmark(&mut self, value: &HostValue) {
        if let Some(id) = value.ptr_id() {
            self.modes.remove(&id);
            self.wrappers.remove(&id);
        }
    }

    pub(crate) fn mode_of(&mut self, value: &HostValue) -> Option<SyncMode> {
        let id = value.ptr_id()?;
        match self.modes.get(&id) {
            Some((weak, mode)) => match weak.upgrade() {
                Some(_) => Some(*mode),
                None => {
                    self.modes.remove(&id);
                    None
                }
            },
            None => None,
        }
    }

    fn cached_wrapper(&mut self, target_id: usize) -> Option<HostValue> {
        self.wrappers.get(&target_id).cloned()
    }

    fn cache_wrapper(&mut self, target_id: usize, wrapper: &HostValue) {
        self.wrappers.insert(target_id, wrapper.clone());
    }

    pub(crate) fn clear(&mut self) {
        self.modes.clear();
        self.wrappers.clear();
    }
}

/// Strip sync wrappers from a host value
pub(crate) fn unwrap_host(value: &HostValue) -> HostValue {
    let mut cur = value.clone();
    while let Some(target) = cur.as_object().and_then(HostObject::proxy_target) {
        cur = HostValue::Object(target);
    }
    cur
}

/// Strip sync wrappers from a guest handle; returns an owned handle
pub(crate) fn unwrap_guest(vm: &Vm, h: GuestHandle) -> VmResult<GuestHandle> {
    let mut cur = vm.retain(h)?;
    while let Some(target) = vm.proxy_target(cur)? {
        vm.release(cur);
        cur = target;
    }
    Ok(cur)
}

/// Removes a value from the in-flight set when the cross-boundary call
/// that put it there unwinds
pub(crate) struct InFlightGuard {
    core: Rc<Core>,
    id: Option<usize>,
}

impl InFlightGuard {
    pub(crate) fn new(core: &Rc<Core>, value: &HostValue) -> Self {
        let id = unwrap_host(value)
            .ptr_id()
            .filter(|id| core.in_flight.borrow_mut().insert(*id));
        Self {
            core: core.clone(),
            id,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.core.in_flight.borrow_mut().remove(&id);
        }
    }
}

/// Host-side wrapper: reads stay local, writes follow the value's
/// discipline. One wrapper exists per target; wrapping a wrapper is a
/// no-op.
pub(crate) fn wrap_host(core: &Rc<Core>, value: &HostValue) -> HostValue {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    if obj.is_proxy() {
        return value.clone();
    }
    if let Some(cached) = core.sync.borrow_mut().cached_wrapper(obj.ptr_id()) {
        return cached;
    }
    let handler = Rc::new(SyncHandler {
        core: Rc::downgrade(core),
    });
    let wrapper = HostValue::Object(HostObject::proxy(obj.clone(), handler));
    core.sync.borrow_mut().cache_wrapper(obj.ptr_id(), &wrapper);
    wrapper
}

struct SyncHandler {
    core: std::rc::Weak<Core>,
}

impl HostProxyHandler for SyncHandler {
    fn get(&self, target: &HostObject, key: &HostKey) -> BridgeResult<HostValue> {
        target.get(key)
    }

    fn set(&self, target: &HostObject, key: HostKey, value: HostValue) -> BridgeResult<bool> {
        if key.is_proto_key() {
            return Ok(false);
        }
        let Some(core) = self.core.upgrade() else {
            return Err(BridgeError::Disposed);
        };
        let value = unwrap_host(&value);
        let tv = HostValue::Object(target.clone());
        match core.resolve_host_mode(&tv) {
            SyncMode::Host => target.set(key, value),
            SyncMode::Vm => {
                replay_guest_set(&core, &tv, &key, &value)?;
                Ok(true)
            }
            SyncMode::Both => {
                if !target.set(key.clone(), value.clone())? {
                    return Ok(false);
                }
                replay_guest_set(&core, &tv, &key, &value)?;
                Ok(true)
            }
        }
    }

    fn delete(&self, target: &HostObject, key: &HostKey) -> BridgeResult<bool> {
        if key.is_proto_key() {
            return Ok(false);
        }
        let Some(core) = self.core.upgrade() else {
            return Err(BridgeError::Disposed);
        };
        let tv = HostValue::Object(target.clone());
        match core.resolve_host_mode(&tv) {
            SyncMode::Host => target.delete(key),
            SyncMode::Vm => {
                replay_guest_delete(&core, &tv, key)?;
                Ok(true)
            }
            SyncMode::Both => {
                if !target.delete(key)? {
                    return Ok(false);
                }
                replay_guest_delete(&core, &tv, key)?;
                Ok(true)
            }
        }
    }
}

fn raw_guest_of(core: &Rc<Core>, host: &HostValue) -> BridgeResult<GuestHandle> {
    // Marshaling returns the wrapped mirror for synced values; the
    // replay target is always the raw one underneath.
    let h = core.marshal_root(host)?;
    let raw = unwrap_guest(&core.vm, h)?;
    core.vm.release(h);
    Ok(raw)
}

fn replay_guest_set(
    core: &Rc<Core>,
    host: &HostValue,
    key: &HostKey,
    value: &HostValue,
) -> BridgeResult<()> {
    trace!(key = %key.render(), "replay set into guest");
    let raw = raw_guest_of(core, host)?;
    let result = (|| -> BridgeResult<()> {
        let pkey = core.guest_key(key)?;
        let vh = core.marshal_root(value)?;
        let res = core.vm.set_prop(raw, pkey, vh);
        core.vm.release(vh);
        res?;
        Ok(())
    })();
    core.vm.release(raw);
    result
}

fn replay_guest_delete(core: &Rc<Core>, host: &HostValue, key: &HostKey) -> BridgeResult<()> {
    trace!(key = %key.render(), "replay delete into guest");
    let raw = raw_guest_of(core, host)?;
    let result = (|| -> BridgeResult<()> {
        let pkey = core.guest_key(key)?;
        core.vm.delete_prop(raw, &pkey)?;
        Ok(())
    })();
    core.vm.release(raw);
    result
}

/// Guest-side wrapper: an engine proxy whose set/delete traps replay
/// writes to the raw host counterpart. Owned handle; wrapping an
/// existing wrapper just retains it.
pub(crate) fn wrap_guest(
    core: &Rc<Core>,
    host: &HostValue,
    raw: GuestHandle,
) -> BridgeResult<GuestHandle> {
    let vm = core.vm.clone();
    if vm.is_proxy(raw)? {
        return Ok(vm.retain(raw)?);
    }
    let host = unwrap_host(host);

    let set_trap = {
        let weak = Rc::downgrade(core);
        let host = host.clone();
        vm.new_function(
            "",
            Rc::new(move |vm: &Vm, call: NativeCall| guest_set_trap(vm, &call, &weak, &host)),
        )
    };
    let delete_trap = {
        let weak = Rc::downgrade(core);
        let host = host.clone();
        vm.new_function(
            "",
            Rc::new(move |vm: &Vm, call: NativeCall| guest_delete_trap(vm, &call, &weak, &host)),
        )
    };
    let proxy = vm.new_proxy(
        raw,
        ProxyTrapHandles {
            get: None,
            set: Some(set_trap),
            delete: Some(delete_trap),
        },
    );
    vm.release(set_trap);
    vm.release(delete_trap);
    Ok(proxy?)
}

fn trap_arg(call: &NativeCall, i: usize) -> VmResult<GuestHandle> {
    call.args
        .get(i)
        .copied()
        .ok_or_else(|| VmError::type_error("missing trap argument"))
}

fn guest_set_trap(
    vm: &Vm,
    call: &NativeCall,
    weak: &std::rc::Weak<Core>,
    host: &HostValue,
) -> VmResult<GuestHandle> {
    let target = trap_arg(call, 0)?;
    let key = vm.prop_key(trap_arg(call, 1)?)?;
    if matches!(&key, PropertyKey::String(s) if &**s == "__proto__") {
        return Ok(vm.new_bool(false));
    }
    let Some(core) = weak.upgrade() else {
        return Err(VmError::type_error("arena is disposed"));
    };
    let value = unwrap_guest(vm, trap_arg(call, 2)?)?;
    let result = (|| -> BridgeResult<bool> {
        match core.resolve_guest_mode(host) {
            SyncMode::Vm => Ok(vm.set_prop(target, key.clone(), value)?),
            SyncMode::Host => {
                replay_host_set(&core, host, &key, value)?;
                Ok(true)
            }
            SyncMode::Both => {
                if !vm.set_prop(target, key.clone(), value)? {
                    return Ok(false);
                }
                replay_host_set(&core, host, &key, value)?;
                Ok(true)
            }
        }
    })();
    vm.release(value);
    match result {
        Ok(b) => Ok(vm.new_bool(b)),
        Err(e) => Err(marshal::raise_in_guest(&core, e)),
    }
}

fn guest_delete_trap(
    vm: &Vm,
    call: &NativeCall,
    weak: &std::rc::Weak<Core>,
    host: &HostValue,
) -> VmResult<GuestHandle> {
    let target = trap_arg(call, 0)?;
    let key = vm.prop_key(trap_arg(call, 1)?)?;
    if matches!(&key, PropertyKey::String(s) if &**s == "__proto__") {
        return Ok(vm.new_bool(false));
    }
    let Some(core) = weak.upgrade() else {
        return Err(VmError::type_error("arena is disposed"));
    };
    let result = (|| -> BridgeResult<bool> {
        match core.resolve_guest_mode(host) {
            SyncMode::Vm => Ok(vm.delete_prop(target, &key)?),
            SyncMode::Host => {
                replay_host_delete(&core, host, &key)?;
                Ok(true)
            }
            SyncMode::Both => {
                if !vm.delete_prop(target, &key)? {
                    return Ok(false);
                }
                replay_host_delete(&core, host, &key)?;
                Ok(true)
            }
        }
    })();
    match result {
        Ok(b) => Ok(vm.new_bool(b)),
        Err(e) => Err(marshal::raise_in_guest(&core, e)),
    }
}

fn replay_host_set(
    core: &Rc<Core>,
    host: &HostValue,
    key: &PropertyKey,
    value: GuestHandle,
) -> BridgeResult<()> {
    trace!(key = %key.render(), "replay set into host");
    let Some(obj) = host.as_object() else {
        return Ok(());
    };
    let hkey = core.host_key(key)?;
    let hv = core.unmarshal_root(value)?;
    obj.set(hkey, unwrap_host(&hv))?;
    Ok(())
}

fn replay_host_delete(core: &Rc<Core>, host: &HostValue, key: &PropertyKey) -> BridgeResult<()> {
    trace!(key = %key.render(), "replay delete into host");
    let Some(obj) = host.as_object() else {
        return Ok(());
    };
    let hkey = core.host_key(key)?;
    obj.delete(&hkey)?;
    Ok(())
}
