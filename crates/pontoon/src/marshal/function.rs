use pontoon_vm::{GuestHandle, NativeCall, Vm, VmError, VmResult};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostObject, HostValue};
use crate::identity::IdentityMap;
use crate::sync::{self, InFlightGuard};

use super::{finish_mirror, raise_in_guest};

/// Mirror a host callable as a guest function. Invocation unmarshals
/// `this` and the arguments, runs the host callable, and marshals the
/// result back. Guest `new` on a class-capable callable is replayed as
/// a host construction and the instance mirror becomes the construct
/// result. Like other mirrors, the function is registered before its
/// own properties are copied (the `prototype`/`constructor` pair is
/// cyclic).
pub(crate) fn marshal_function(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
    obj: &HostObject,
) -> BridgeResult<GuestHandle> {
    let weak = Rc::downgrade(core);
    let host_obj = obj.clone();
    let is_class = obj.is_class();
    let f = core.vm.new_function(
        &obj.name(),
        Rc::new(move |vm: &Vm, call: NativeCall| {
            invoke_host(vm, &call, &weak, &host_obj, is_class)
        }),
    );
    scratch.borrow_mut().register(value, f)?;
    finish_mirror(core, scratch, value, obj, f)
}

fn invoke_host(
    _vm: &Vm,
    call: &NativeCall,
    weak: &Weak<Core>,
    host_obj: &HostObject,
    is_class: bool,
) -> VmResult<GuestHandle> {
    let Some(core) = weak.upgrade() else {
        return Err(VmError::type_error("arena is disposed"));
    };
    let run = || -> BridgeResult<GuestHandle> {
        let mut args = Vec::with_capacity(call.args.len());
        for a in &call.args {
            args.push(core.unmarshal_root(*a)?);
        }
        if call.construct && is_class {
            let instance = host_obj.construct(&args)?;
            return core.marshal_root(&instance);
        }
        let this = core.unmarshal_root(call.this)?;
        let result = {
            // `this` must behave two-way for the duration of the call
            let _guard = InFlightGuard::new(&core, &this);
            host_obj.call(this, &args)?
        };
        core.marshal_root(&sync::unwrap_host(&result))
    };
    run().map_err(|e| raise_in_guest(&core, e))
}
