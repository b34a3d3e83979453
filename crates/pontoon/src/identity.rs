//! Host/guest identity map
//!
//! Pairs are keyed by a monotonically increasing counter rather than by
//! either side's pointer directly. The counter is stamped onto the guest
//! object as an engine tag, so lookup from a guest handle is a tag read
//! followed by a counter lookup, and lookup from a host value is a
//! pointer-id lookup. Each pair may additionally carry a wrapped variant
//! on both sides (the sync proxies); `get` prefers the wrapped handle,
//! `get_raw` bypasses it.
//!
//! Both sides of a pair are owned by the map: guest handles are
//! retained and released on delete or dispose, and host values are held
//! strongly, so a mapped host object survives even when the caller's
//! last reference moved into the bridge. Without that, a guest-side
//! `this` would unmarshal to a fresh copy and writes through bridged
//! accessors would land nowhere.

use pontoon_vm::{GuestHandle, Vm};
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::host::HostValue;

pub(crate) struct IdentityMap {
    vm: Vm,
    counter: Rc<Cell<u64>>,
    host_to_counter: FxHashMap<usize, u64>,
    wrapped_host_to_counter: FxHashMap<usize, u64>,
    handles: FxHashMap<u64, GuestHandle>,
    wrapped_handles: FxHashMap<u64, GuestHandle>,
    hosts: FxHashMap<u64, HostValue>,
    wrapped_hosts: FxHashMap<u64, HostValue>,
}

impl IdentityMap {
    pub(crate) fn new(vm: Vm, counter: Rc<Cell<u64>>) -> Self {
        Self {
            vm,
            counter,
            host_to_counter: FxHashMap::default(),
            wrapped_host_to_counter: FxHashMap::default(),
            handles: FxHashMap::default(),
            wrapped_handles: FxHashMap::default(),
            hosts: FxHashMap::default(),
            wrapped_hosts: FxHashMap::default(),
        }
    }

    /// An empty map sharing this map's vm and counter allocator. Used as
    /// a per-operation scratch map that is merged back on success.
    pub(crate) fn scratch(&self) -> Self {
        Self::new(self.vm.clone(), self.counter.clone())
    }

    /// Number of live pairs
    pub(crate) fn size(&self) -> usize {
        self.handles.len()
    }

    fn next_counter(&self) -> u64 {
        let c = self.counter.get() + 1;
        self.counter.set(c);
        c
    }

    /// Counter bound to a host value, preferring the wrapped binding
    fn counter_of(&self, host: &HostValue) -> Option<u64> {
        let id = host.ptr_id()?;
        self.wrapped_host_to_counter
            .get(&id)
            .or_else(|| self.host_to_counter.get(&id))
            .copied()
    }

    /// Guest handle for a host value, preferring the wrapped handle.
    /// Stale pairs whose guest side has been disposed (an explicitly
    /// unregistered pair) are dropped lazily here.
    pub(crate) fn get(&mut self, host: &HostValue) -> Option<GuestHandle> {
        let counter = self.counter_of(host)?;
        let handle = self
            .wrapped_handles
            .get(&counter)
            .or_else(|| self.handles.get(&counter))
            .copied()?;
        if self.vm.is_alive(handle) {
            Some(handle)
        } else {
            self.delete_counter(counter);
            None
        }
    }

    /// Raw (unwrapped) guest handle for a host value
    pub(crate) fn get_raw(&mut self, host: &HostValue) -> Option<GuestHandle> {
        let counter = self.counter_of(host)?;
        let handle = self.handles.get(&counter).copied()?;
        if self.vm.is_alive(handle) {
            Some(handle)
        } else {
            self.delete_counter(counter);
            None
        }
    }

    /// Host value bound to a counter, preferring the wrapped (sync proxy)
    /// variant
    pub(crate) fn host_by_counter(&self, counter: u64) -> Option<HostValue> {
        self.wrapped_hosts
            .get(&counter)
            .cloned()
            .or_else(|| self.raw_host_by_counter(counter))
    }

    /// Raw (unwrapped) host value bound to a counter
    pub(crate) fn raw_host_by_counter(&self, counter: u64) -> Option<HostValue> {
        self.hosts.get(&counter).cloned()
    }

    /// Bind a host value to a guest handle under a fresh counter. The
    /// handle is retained by the map; the caller keeps its own
    /// reference. Rebinding either side to a different counterpart is
    /// fatal.
    pub(crate) fn register(
        &mut self,
        host: &HostValue,
        handle: GuestHandle,
    ) -> BridgeResult<u64> {
        if handle.vm_id() != self.vm.id() {
            return Err(BridgeError::VmMismatch);
        }
        if !self.vm.is_alive(handle) {
            return Err(BridgeError::HandleNotAlive);
        }
        let Some(id) = host.ptr_id() else {
            return Err(BridgeError::host("cannot register a primitive"));
        };
        if let Some(existing) = self.host_to_counter.get(&id) {
            // Re-registering the identical pair is tolerated
            let identical = self
                .handles
                .get(existing)
                .is_some_and(|h| matches!(self.vm.same_value(*h, handle), Ok(true)));
            if identical {
                return Ok(*existing);
            }
            return Err(BridgeError::AlreadyRegistered);
        }
        if let Some(tag) = self.vm.tag_of(handle)? {
            if self.hosts.contains_key(&tag) {
                return Err(BridgeError::AlreadyRegistered);
            }
        }
        let counter = self.next_counter();
        self.vm.retain(handle)?;
        self.vm.set_tag(handle, counter)?;
        self.host_to_counter.insert(id, counter);
        self.handles.insert(counter, handle);
        self.hosts.insert(counter, host.clone());
        trace!(counter, "identity pair registered");
        Ok(counter)
    }

    /// Attach wrapped (sync proxy) variants to an existing pair
    pub(crate) fn attach_wrapped(
        &mut self,
        host: &HostValue,
        wrapped_host: &HostValue,
        wrapped_handle: GuestHandle,
    ) -> BridgeResult<()> {
        let Some(counter) = self.counter_of(host) else {
            return Err(BridgeError::host("value is not registered"));
        };
        let Some(wrapped_id) = wrapped_host.ptr_id() else {
            return Err(BridgeError::host("cannot register a primitive"));
        };
        self.vm.retain(wrapped_handle)?;
        self.vm.set_tag(wrapped_handle, counter)?;
        self.wrapped_host_to_counter.insert(wrapped_id, counter);
        self.wrapped_handles.insert(counter, wrapped_handle);
        self.wrapped_hosts.insert(counter, wrapped_host.clone());
        Ok(())
    }

    fn delete_counter(&mut self, counter: u64) {
        if let Some(h) = self.handles.remove(&counter) {
            let _ = self.vm.clear_tag(h);
            self.vm.release(h);
        }
        if let Some(h) = self.wrapped_handles.remove(&counter) {
            let _ = self.vm.clear_tag(h);
            self.vm.release(h);
        }
        if let Some(host) = self.hosts.remove(&counter) {
            if let Some(id) = host.ptr_id() {
                self.host_to_counter.remove(&id);
            }
        }
        if let Some(host) = self.wrapped_hosts.remove(&counter) {
            if let Some(id) = host.ptr_id() {
                self.wrapped_host_to_counter.remove(&id);
            }
        }
        trace!(counter, "identity pair deleted");
    }

    /// Remove the pair a host value belongs to, releasing its guest side
    pub(crate) fn delete(&mut self, host: &HostValue) {
        if let Some(counter) = self.counter_of(host) {
            self.delete_counter(counter);
        }
    }

    /// Move every pair of `other` into this map. A pair whose host value
    /// is already bound here to a different guest counterpart is a
    /// collision; the merge stops and the caller disposes `other`.
    pub(crate) fn merge(&mut self, other: &mut IdentityMap) -> BridgeResult<()> {
        let counters: Vec<u64> = other.handles.keys().copied().collect();
        for counter in counters {
            let Some(host) = other.raw_host_by_counter(counter) else {
                continue;
            };
            let Some(handle) = other.handles.get(&counter).copied() else {
                continue;
            };
            if let Some(id) = host.ptr_id() {
                if let Some(existing) = self.host_to_counter.get(&id) {
                    let identical = self
                        .handles
                        .get(existing)
                        .is_some_and(|h| matches!(self.vm.same_value(*h, handle), Ok(true)));
                    if !identical {
                        return Err(BridgeError::AlreadyRegistered);
                    }
                    continue;
                }
                // Ownership of the retained handle and the host value
                // moves with the entry
                other.host_to_counter.remove(&id);
                other.handles.remove(&counter);
                self.host_to_counter.insert(id, counter);
                self.handles.insert(counter, handle);
                self.hosts.insert(counter, host);
                other.hosts.remove(&counter);
                if let Some(wrapped) = other.wrapped_handles.remove(&counter) {
                    self.wrapped_handles.insert(counter, wrapped);
                }
                if let Some(wrapped_host) = other.wrapped_hosts.remove(&counter) {
                    self.wrapped_hosts.insert(counter, wrapped_host);
                }
                let mut moved_wrapped = Vec::new();
                other.wrapped_host_to_counter.retain(|id, c| {
                    if *c == counter {
                        moved_wrapped.push(*id);
                        false
                    } else {
                        true
                    }
                });
                for id in moved_wrapped {
                    self.wrapped_host_to_counter.insert(id, counter);
                }
            }
        }
        Ok(())
    }

    /// Release every guest handle and clear the map
    pub(crate) fn dispose(&mut self) {
        for (_, h) in self.handles.drain() {
            let _ = self.vm.clear_tag(h);
            self.vm.release(h);
        }
        for (_, h) in self.wrapped_handles.drain() {
            let _ = self.vm.clear_tag(h);
            self.vm.release(h);
        }
        self.host_to_counter.clear();
        self.wrapped_host_to_counter.clear();
        self.hosts.clear();
        self.wrapped_hosts.clear();
    }
}

impl Drop for IdentityMap {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostObject;

    fn fresh_map() -> (Vm, IdentityMap) {
        let vm = Vm::new();
        let map = IdentityMap::new(vm.clone(), Rc::new(Cell::new(0)));
        (vm, map)
    }

    #[test]
    fn test_register_and_get() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        map.register(&host, handle).unwrap();
        let got = map.get(&host).unwrap();
        assert!(vm.same_value(got, handle).unwrap());
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_register_same_pair_twice_is_noop() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        let c1 = map.register(&host, handle).unwrap();
        let c2 = map.register(&host, handle).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let h1 = vm.new_object();
        let h2 = vm.new_object();
        map.register(&host, h1).unwrap();
        assert!(matches!(
            map.register(&host, h2),
            Err(BridgeError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_handle_bound_elsewhere_fails() {
        let (vm, mut map) = fresh_map();
        let a = HostValue::Object(HostObject::new());
        let b = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        map.register(&a, handle).unwrap();
        assert!(matches!(
            map.register(&b, handle),
            Err(BridgeError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_foreign_vm_handle_rejected() {
        let (_vm, mut map) = fresh_map();
        let other = Vm::new();
        let host = HostValue::Object(HostObject::new());
        let handle = other.new_object();
        assert!(matches!(
            map.register(&host, handle),
            Err(BridgeError::VmMismatch)
        ));
    }

    #[test]
    fn test_stale_guest_pair_dropped_lazily() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        map.register(&host, handle).unwrap();
        // Drop both the caller's and the map's reference
        vm.release(handle);
        if let Some(held) = map.handles.values().next().copied() {
            vm.release(held);
        }
        assert!(map.get(&host).is_none());
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn test_mapped_host_value_stays_alive() {
        let (vm, mut map) = fresh_map();
        let handle = vm.new_object();
        // The caller's only reference moves out of scope here
        let counter = {
            let host = HostValue::Object(HostObject::new());
            map.register(&host, handle).unwrap()
        };
        let kept = map.host_by_counter(counter).unwrap();
        let back = map.get(&kept).unwrap();
        assert!(vm.same_value(back, handle).unwrap());
    }

    #[test]
    fn test_merge_moves_pairs() {
        let (vm, mut map) = fresh_map();
        let mut scratch = map.scratch();
        let host = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        scratch.register(&host, handle).unwrap();
        map.merge(&mut scratch).unwrap();
        assert_eq!(map.size(), 1);
        assert_eq!(scratch.size(), 0);
        assert!(map.get(&host).is_some());
    }

    #[test]
    fn test_merge_keeps_host_side_alive() {
        let (vm, mut map) = fresh_map();
        let handle = vm.new_object();
        let counter = {
            let host = HostValue::Object(HostObject::new());
            let mut scratch = map.scratch();
            let c = scratch.register(&host, handle).unwrap();
            map.merge(&mut scratch).unwrap();
            c
        };
        assert!(map.raw_host_by_counter(counter).is_some());
    }

    #[test]
    fn test_merge_conflict_fails() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let h1 = vm.new_object();
        map.register(&host, h1).unwrap();
        let mut scratch = map.scratch();
        let h2 = vm.new_object();
        scratch.register(&host, h2).unwrap();
        assert!(matches!(
            map.merge(&mut scratch),
            Err(BridgeError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_wrapped_preferred_raw_bypasses() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let wrapped_host = HostValue::Object(HostObject::new());
        let raw = vm.new_object();
        let wrapped = vm.new_object();
        map.register(&host, raw).unwrap();
        map.attach_wrapped(&host, &wrapped_host, wrapped).unwrap();
        let got = map.get(&host).unwrap();
        assert!(vm.same_value(got, wrapped).unwrap());
        let got_raw = map.get_raw(&wrapped_host).unwrap();
        assert!(vm.same_value(got_raw, raw).unwrap());
        assert!(map.get(&wrapped_host).is_some());
    }

    #[test]
    fn test_dispose_releases_handles() {
        let (vm, mut map) = fresh_map();
        let host = HostValue::Object(HostObject::new());
        let handle = vm.new_object();
        map.register(&host, handle).unwrap();
        map.dispose();
        assert_eq!(map.size(), 0);
        // Caller's reference is still alive
        assert!(vm.is_alive(handle));
    }
}
