//! Guest → host value construction
//!
//! Mirror image of the marshal engine: identity short-circuit first
//! (which also serves disposed-but-already-mapped handles through the
//! engine's weak tag table), then primitives, then shape dispatch with
//! pre-registration before contents.

mod function;
mod object;
mod promise;
mod symbol;

use pontoon_vm::{GuestHandle, VmError};
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostObject, HostValue};
use crate::identity::IdentityMap;
use crate::{sync, transfer};

pub(crate) fn unmarshal(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<HostValue> {
    let vm = &core.vm;
    if let Some(found) = find(core, scratch, handle)? {
        return Ok(found);
    }
    if !vm.is_alive(handle) {
        return Err(BridgeError::HandleNotAlive);
    }
    match vm.type_of(handle)? {
        "undefined" => Ok(HostValue::Undefined),
        "boolean" => Ok(vm.as_bool(handle)?.map_or(HostValue::Undefined, HostValue::Bool)),
        "number" => Ok(vm
            .as_number(handle)?
            .map_or(HostValue::Undefined, HostValue::Number)),
        "string" => Ok(match vm.as_string(handle)? {
            Some(s) => HostValue::from(s.as_str()),
            None => HostValue::Undefined,
        }),
        "symbol" => symbol::unmarshal_symbol(core, scratch, handle),
        "function" => function::unmarshal_function(core, scratch, handle),
        _ => {
            if vm.is_null(handle)? {
                Ok(HostValue::Null)
            } else if vm.is_promise(handle)? {
                promise::unmarshal_promise(core, scratch, handle)
            } else {
                object::unmarshal_object(core, scratch, handle)
            }
        }
    }
}

/// Reverse identity lookup through the guest-side counter tag. Works on
/// disposed handles, so an already-mapped value keeps resolving to its
/// existing mirror.
fn find(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<Option<HostValue>> {
    let counter = core.vm.tag_of(handle).map_err(|e| match e {
        VmError::WrongVm => BridgeError::VmMismatch,
        other => BridgeError::from(other),
    })?;
    let Some(counter) = counter else {
        return Ok(None);
    };
    if let Some(v) = core.registered.borrow_mut().host_by_counter(counter) {
        return Ok(Some(v));
    }
    if let Some(v) = core.map.borrow_mut().host_by_counter(counter) {
        return Ok(Some(v));
    }
    if let Some(v) = scratch.borrow_mut().host_by_counter(counter) {
        return Ok(Some(v));
    }
    Ok(None)
}

/// Shared tail for object-shaped mirrors: prototype, properties, then
/// live-sync wrapping when the mirror is registered for it.
fn finish_mirror(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
    obj: &HostObject,
    host: &HostValue,
) -> BridgeResult<HostValue> {
    if let Some(ph) = core.vm.custom_proto_of(handle)? {
        let proto = unmarshal(core, scratch, ph);
        core.vm.release(ph);
        obj.set_proto(proto?);
    }
    transfer::guest_to_host(core, scratch, handle, obj)?;
    if core.sync_enabled(host) {
        let wrapped_host = sync::wrap_host(core, host);
        let wrapped_handle = sync::wrap_guest(core, host, handle)?;
        let res = scratch
            .borrow_mut()
            .attach_wrapped(host, &wrapped_host, wrapped_handle);
        core.vm.release(wrapped_handle);
        res?;
        Ok(wrapped_host)
    } else {
        Ok(host.clone())
    }
}
