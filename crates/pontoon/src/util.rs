//! Small helpers shared across the bridge

use pontoon_vm::{GuestHandle, Vm};
use rustc_hash::FxHashSet;

use crate::host::{HostDescriptor, HostValue};

/// Scoped collection of owned guest handles, released on drop. Keeps
/// error paths from leaking intermediate handles.
pub(crate) struct OwnedHandles {
    vm: Vm,
    handles: Vec<GuestHandle>,
}

impl OwnedHandles {
    pub(crate) fn new(vm: Vm) -> Self {
        Self {
            vm,
            handles: Vec::new(),
        }
    }

    /// Take ownership of a handle; returns it for convenience
    pub(crate) fn push(&mut self, h: GuestHandle) -> GuestHandle {
        self.handles.push(h);
        h
    }

    pub(crate) fn as_slice(&self) -> &[GuestHandle] {
        &self.handles
    }
}

impl Drop for OwnedHandles {
    fn drop(&mut self) {
        for h in self.handles.drain(..) {
            self.vm.release(h);
        }
    }
}

/// Walk the object-reachable closure of `root`: own data values, getters
/// and setters, and prototypes. `visit` sees each identity-bearing value
/// exactly once, `root` included.
pub(crate) fn walk_object(root: &HostValue, visit: &mut dyn FnMut(&HostValue)) {
    let mut seen = FxHashSet::default();
    let mut stack = vec![root.clone()];
    while let Some(value) = stack.pop() {
        let Some(id) = value.ptr_id() else {
            continue;
        };
        if !seen.insert(id) {
            continue;
        }
        visit(&value);
        let Some(obj) = value.as_object() else {
            continue;
        };
        for key in obj.own_keys() {
            match obj.own_descriptor(&key) {
                Some(HostDescriptor::Data { value, .. }) => stack.push(value),
                Some(HostDescriptor::Accessor { get, set, .. }) => {
                    if let Some(g) = get {
                        stack.push(g);
                    }
                    if let Some(s) = set {
                        stack.push(s);
                    }
                }
                None => {}
            }
        }
        if let Some(proto) = obj.proto() {
            stack.push(proto);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostKey, HostObject};

    #[test]
    fn test_walk_visits_nested_once() {
        let a = HostObject::new();
        let b = HostObject::new();
        b.set(HostKey::string("back"), HostValue::Object(a.clone()))
            .unwrap();
        a.set(HostKey::string("child"), HostValue::Object(b.clone()))
            .unwrap();
        a.set(HostKey::string("n"), HostValue::Number(1.0)).unwrap();
        let mut count = 0;
        walk_object(&HostValue::Object(a), &mut |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_walk_follows_accessors_and_proto() {
        let proto = HostObject::new();
        let getter = HostObject::function("g", std::rc::Rc::new(|_, _| Ok(HostValue::Undefined)));
        let obj = HostObject::new();
        obj.set_proto(HostValue::Object(proto.clone()));
        obj.define(
            HostKey::string("x"),
            HostDescriptor::Accessor {
                get: Some(HostValue::Object(getter.clone())),
                set: None,
                attributes: pontoon_vm::PropertyAttributes::data(),
            },
        );
        let mut ids = Vec::new();
        walk_object(&HostValue::Object(obj), &mut |v| {
            if let Some(id) = v.as_object().map(|o| o.ptr_id()) {
                ids.push(id);
            }
        });
        assert!(ids.contains(&proto.ptr_id()));
        assert!(ids.contains(&getter.ptr_id()));
    }
}
