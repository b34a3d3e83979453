//! Host → guest value construction
//!
//! Dispatch runs in a fixed priority order: primitive codec, identity
//! short-circuit, marshalability gate, then shape dispatch (symbol,
//! promise, callable, object). Object-shaped mirrors are registered in
//! the scratch identity map before their contents are filled in, which
//! is what makes cyclic graphs terminate.

mod function;
mod json;
mod object;
mod promise;
mod symbol;

use pontoon_vm::{GuestHandle, VmError};
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::{Core, Marshalable};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostObject, HostValue};
use crate::identity::IdentityMap;
use crate::{sync, transfer};

pub(crate) fn marshal(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
) -> BridgeResult<GuestHandle> {
    let vm = &core.vm;
    match value {
        HostValue::Undefined => return Ok(vm.undefined()),
        HostValue::Null => return Ok(vm.null_handle()),
        HostValue::Bool(b) => return Ok(vm.new_bool(*b)),
        HostValue::Number(n) => return Ok(vm.new_number(*n)),
        HostValue::String(s) => return Ok(vm.new_string(s)),
        _ => {}
    }
    if let Some(found) = find(core, scratch, value)? {
        return Ok(found);
    }
    match core.marshalable(value) {
        Marshalable::Reference => {}
        Marshalable::Deny => return Ok(vm.undefined()),
        Marshalable::Json => return json::marshal_json(core, value),
    }
    match value {
        HostValue::Symbol(s) => symbol::marshal_symbol(core, scratch, value, s),
        HostValue::Promise(p) => promise::marshal_promise(core, scratch, value, p),
        HostValue::Object(o) if o.is_callable() => {
            function::marshal_function(core, scratch, value, o)
        }
        HostValue::Object(o) => object::marshal_object(core, scratch, value, o),
        _ => Ok(vm.undefined()),
    }
}

/// Identity short-circuit: registered pairs first, then the long-lived
/// map, then pairs created earlier in this traversal. Returns an owned
/// handle.
fn find(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
) -> BridgeResult<Option<GuestHandle>> {
    let found = core
        .registered
        .borrow_mut()
        .get(value)
        .or_else(|| core.map.borrow_mut().get(value))
        .or_else(|| scratch.borrow_mut().get(value));
    match found {
        Some(h) => Ok(Some(core.vm.retain(h)?)),
        None => Ok(None),
    }
}

/// Shared tail for object-shaped mirrors: prototype transfer, property
/// transfer, then live-sync wrapping. Consumes ownership of `raw` and
/// returns the handle the caller should hand out.
fn finish_mirror(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    host: &HostValue,
    obj: &HostObject,
    raw: GuestHandle,
) -> BridgeResult<GuestHandle> {
    if let Some(proto) = obj.proto() {
        let ph = marshal(core, scratch, &proto)?;
        let res = core.vm.set_proto(raw, ph);
        core.vm.release(ph);
        res?;
    }
    transfer::host_to_guest(core, scratch, obj, raw)?;
    if core.sync_enabled(host) {
        let wrapped_host = sync::wrap_host(core, host);
        let wrapped = sync::wrap_guest(core, host, raw)?;
        if let Err(e) = scratch
            .borrow_mut()
            .attach_wrapped(host, &wrapped_host, wrapped)
        {
            core.vm.release(wrapped);
            return Err(e);
        }
        core.vm.release(raw);
        Ok(wrapped)
    } else {
        Ok(raw)
    }
}

/// Convert a bridge failure into a guest-throwable error; used by
/// native functions the marshal and sync layers install in the guest.
pub(crate) fn raise_in_guest(core: &Rc<Core>, e: BridgeError) -> VmError {
    match e {
        BridgeError::Vm(e) => e,
        BridgeError::Exception { value, .. } => match core.marshal_root(&value) {
            Ok(h) => {
                let err = core.vm.throw(h);
                core.vm.release(h);
                err
            }
            Err(other) => VmError::type_error(other.to_string()),
        },
        other => VmError::type_error(other.to_string()),
    }
}
