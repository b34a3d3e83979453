use pontoon_vm::GuestHandle;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::BridgeResult;
use crate::host::{HostSymbol, HostValue};
use crate::identity::IdentityMap;

/// A guest symbol mirroring the host one; the description travels, the
/// identity is held by the pair.
pub(crate) fn marshal_symbol(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    value: &HostValue,
    sym: &HostSymbol,
) -> BridgeResult<GuestHandle> {
    let h = core.vm.new_symbol(sym.description());
    scratch.borrow_mut().register(value, h)?;
    Ok(h)
}
