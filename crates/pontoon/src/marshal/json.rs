use pontoon_vm::{GuestHandle, PropertyKey};
use rustc_hash::FxHashSet;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostKey, HostValue};

/// One-shot structural copy for values whose identity need not be
/// preserved: a deep copy through JSON-like rules, never registered in
/// the identity map. Functions, symbols and promises are dropped from
/// objects and become null in arrays; cycles are an error.
pub(crate) fn marshal_json(core: &Rc<Core>, value: &HostValue) -> BridgeResult<GuestHandle> {
    let mut visiting = FxHashSet::default();
    copy(core, value, &mut visiting)
}

fn serializable(value: &HostValue) -> bool {
    match value {
        HostValue::Undefined | HostValue::Symbol(_) | HostValue::Promise(_) => false,
        HostValue::Object(o) => !o.is_callable(),
        _ => true,
    }
}

fn copy(
    core: &Rc<Core>,
    value: &HostValue,
    visiting: &mut FxHashSet<usize>,
) -> BridgeResult<GuestHandle> {
    let vm = &core.vm;
    match value {
        HostValue::Undefined | HostValue::Symbol(_) | HostValue::Promise(_) => Ok(vm.undefined()),
        HostValue::Null => Ok(vm.null_handle()),
        HostValue::Bool(b) => Ok(vm.new_bool(*b)),
        HostValue::Number(n) => Ok(vm.new_number(*n)),
        HostValue::String(s) => Ok(vm.new_string(s)),
        HostValue::Object(o) if o.is_callable() => Ok(vm.undefined()),
        HostValue::Object(o) => {
            let id = o.ptr_id();
            if !visiting.insert(id) {
                return Err(BridgeError::host("converting circular structure to json"));
            }
            let dst = if o.is_array() {
                vm.new_array()
            } else {
                vm.new_object()
            };
            let result = (|| -> BridgeResult<()> {
                for key in o.own_keys() {
                    let pkey = match &key {
                        HostKey::String(s) => PropertyKey::String(s.clone()),
                        HostKey::Index(i) => PropertyKey::Index(*i),
                        HostKey::Symbol(_) => continue,
                    };
                    let Some(desc) = o.own_descriptor(&key) else {
                        continue;
                    };
                    if !desc.attributes().enumerable {
                        continue;
                    }
                    // getters are invoked, like a structural stringify
                    let child = o.get(&key)?;
                    let ch = if serializable(&child) {
                        copy(core, &child, visiting)?
                    } else if o.is_array() {
                        vm.null_handle()
                    } else {
                        continue;
                    };
                    let res = vm.set_prop(dst, pkey, ch);
                    vm.release(ch);
                    res?;
                }
                Ok(())
            })();
            visiting.remove(&id);
            match result {
                Ok(()) => Ok(dst),
                Err(e) => {
                    vm.release(dst);
                    Err(e)
                }
            }
        }
    }
}
