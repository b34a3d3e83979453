use pontoon_vm::{GuestHandle, NativeCall, Vm, VmResult};
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostPromise, HostValue};
use crate::identity::IdentityMap;
use crate::marshal::raise_in_guest;

/// A host promise settled by the guest one. The guest-side `then`
/// continuations fire from the job queue, so the host observes
/// settlement only after a drain.
pub(crate) fn unmarshal_promise(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<HostValue> {
    let hp = HostPromise::deferred();
    let host = HostValue::Promise(hp.clone());
    scratch.borrow_mut().register(&host, handle)?;

    let settle = |fulfill: bool| {
        let weak = Rc::downgrade(core);
        let hp = hp.clone();
        core.vm.new_function(
            "",
            Rc::new(move |vm: &Vm, call: NativeCall| -> VmResult<GuestHandle> {
                let Some(core) = weak.upgrade() else {
                    return Ok(vm.undefined());
                };
                let value = match call.args.first() {
                    Some(a) => core.unmarshal_root(*a),
                    None => Ok(HostValue::Undefined),
                };
                let res = value.and_then(|v| {
                    if fulfill {
                        hp.resolve(v)
                    } else {
                        hp.reject(v)
                    }
                });
                match res {
                    Ok(()) => Ok(vm.undefined()),
                    Err(e) => Err(raise_in_guest(&core, e)),
                }
            }),
        )
    };
    let on_fulfilled = settle(true);
    let on_rejected = settle(false);
    let res = core
        .vm
        .promise_then(handle, Some(on_fulfilled), Some(on_rejected));
    core.vm.release(on_fulfilled);
    core.vm.release(on_rejected);
    res?;
    Ok(host)
}
