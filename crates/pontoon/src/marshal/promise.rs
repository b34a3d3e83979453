use pontoon_vm::GuestHandle;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostPromise, HostReaction, HostValue};
use crate::identity::IdentityMap;

/// A guest promise settled by the host one. Settlement enqueues guest
/// continuations; observing them requires draining the job queue.
pub(crate) fn marshal_promise(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
    promise: &HostPromise,
) -> BridgeResult<GuestHandle> {
    let gp = core.vm.new_promise();
    scratch.borrow_mut().register(value, gp)?;

    let on_fulfilled: HostReaction = {
        let weak = Rc::downgrade(core);
        Rc::new(move |v: &HostValue| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let h = core.marshal_root(v)?;
            let res = core.vm.resolve_promise(gp, h);
            core.vm.release(h);
            Ok(res?)
        })
    };
    let on_rejected: HostReaction = {
        let weak = Rc::downgrade(core);
        Rc::new(move |v: &HostValue| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let h = core.marshal_root(v)?;
            let res = core.vm.reject_promise(gp, h);
            core.vm.release(h);
            Ok(res?)
        })
    };
    promise.then(Some(on_fulfilled), Some(on_rejected))?;
    Ok(gp)
}
