use pontoon_vm::{GuestHandle, PropertyKey};
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostObject, HostValue};
use crate::identity::IdentityMap;

use super::finish_mirror;

/// Mirror a guest object, array or error. Registered empty, filled in
/// afterwards.
pub(crate) fn unmarshal_object(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<HostValue> {
    let vm = &core.vm;
    let obj = if vm.is_array(handle)? {
        HostObject::array()
    } else if vm.is_error(handle)? {
        let mh = vm.get_prop(handle, &PropertyKey::string("message"))?;
        let message = vm.as_string(mh)?.unwrap_or_default();
        vm.release(mh);
        HostObject::error(&message)
    } else {
        HostObject::new()
    };
    let host = HostValue::Object(obj.clone());
    scratch.borrow_mut().register(&host, handle)?;
    finish_mirror(core, scratch, handle, &obj, &host)
}
