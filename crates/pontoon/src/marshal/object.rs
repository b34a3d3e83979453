use pontoon_vm::GuestHandle;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostKey, HostObject, HostValue};
use crate::identity::IdentityMap;

use super::finish_mirror;

/// Mirror a plain object, array or error. The empty mirror is
/// registered before its contents so self-references resolve through
/// the identity map instead of recursing.
pub(crate) fn marshal_object(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
    obj: &HostObject,
) -> BridgeResult<GuestHandle> {
    let raw = if obj.is_array() {
        core.vm.new_array()
    } else if obj.is_error() {
        let message = obj.get(&HostKey::string("message"))?.render();
        core.vm.new_error(&message)
    } else {
        core.vm.new_object()
    };
    scratch.borrow_mut().register(value, raw)?;
    finish_mirror(core, scratch, value, obj, raw)
}
