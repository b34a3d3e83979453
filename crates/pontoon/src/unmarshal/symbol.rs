use pontoon_vm::GuestHandle;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostSymbol, HostValue};
use crate::identity::IdentityMap;

pub(crate) fn unmarshal_symbol(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    handle: GuestHandle,
) -> BridgeResult<HostValue> {
    let description = core.vm.symbol_description(handle)?;
    let host = HostValue::Symbol(HostSymbol::new(description.as_deref()));
    scratch.borrow_mut().register(&host, handle)?;
    Ok(host)
}
