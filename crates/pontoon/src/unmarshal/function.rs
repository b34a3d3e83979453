use pontoon_vm::GuestHandle;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostFn, HostObject, HostValue};
use crate::identity::IdentityMap;
use crate::util::OwnedHandles;

use super::finish_mirror;

/// Mirror a guest function as a host callable. Calls marshal `this` and
/// the arguments into the guest, invoke the original, and unmarshal the
/// result; guest throws come back as host exceptions. Construction is
/// replayed as a guest `new` so prototype linkage happens in the guest.
pub(crate) fn unmarshal_function(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<HostValue> {
    let name = core.vm.function_name(handle)?;

    // The closures outlive this pass and possibly the identity pair, so
    // they carry their own retain on the guest function.
    let mut anchor = OwnedHandles::new(core.vm.clone());
    anchor.push(core.vm.retain(handle)?);
    let anchor = Rc::new(anchor);

    let call_fn: HostFn = {
        let weak = Rc::downgrade(core);
        let anchor = anchor.clone();
        Rc::new(move |this: HostValue, args: &[HostValue]| {
            let target = anchor.as_slice()[0];
            let Some(core) = weak.upgrade() else {
                return Err(BridgeError::Disposed);
            };
            let mut temps = OwnedHandles::new(core.vm.clone());
            let this_h = temps.push(core.marshal_root(&this)?);
            for a in args {
                let h = core.marshal_root(a)?;
                temps.push(h);
            }
            let result = core
                .vm
                .call_function(target, this_h, &temps.as_slice()[1..]);
            match result {
                Ok(rh) => {
                    let v = core.unmarshal_root(rh);
                    core.vm.release(rh);
                    v
                }
                Err(e) => Err(core.raise(e)),
            }
        })
    };
    let construct_fn: HostFn = {
        let weak = Rc::downgrade(core);
        let anchor = anchor.clone();
        Rc::new(move |_this: HostValue, args: &[HostValue]| {
            let target = anchor.as_slice()[0];
            let Some(core) = weak.upgrade() else {
                return Err(BridgeError::Disposed);
            };
            let mut temps = OwnedHandles::new(core.vm.clone());
            for a in args {
                let h = core.marshal_root(a)?;
                temps.push(h);
            }
            let result = core.vm.construct(target, temps.as_slice());
            match result {
                Ok(rh) => {
                    let v = core.unmarshal_root(rh);
                    core.vm.release(rh);
                    v
                }
                Err(e) => Err(core.raise(e)),
            }
        })
    };

    let obj = HostObject::bridged(&name, call_fn, construct_fn);
    let host = HostValue::Object(obj.clone());
    scratch.borrow_mut().register(&host, handle)?;
    finish_mirror(core, scratch, handle, &obj, &host)
}
