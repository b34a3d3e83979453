//! External handle table
//!
//! Embedders never hold guest values directly; they hold handles into
//! this table. Each slot carries an external reference count: `retain`
//! and `release` adjust it, and a slot whose count reaches zero drops its
//! strong value. Slots are never reused, and object-shaped slots keep a
//! weak shadow after release so identity-tag lookups on a disposed handle
//! can still resolve to an already-mapped mirror.

use std::rc::Weak;

use crate::error::{VmError, VmResult};
use crate::object::GuestObject;
use crate::value::{GuestValue, SymbolData};

/// An opaque, externally reference-counted pointer into the guest heap.
///
/// Handles are cheap ids; copying one does NOT retain it. Whoever
/// receives an owned handle from the engine API must eventually
/// `release` it (or hand ownership on, e.g. to the identity map).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GuestHandle {
    pub(crate) vm: u64,
    pub(crate) slot: u32,
}

impl GuestHandle {
    /// Id of the engine instance this handle belongs to
    pub fn vm_id(&self) -> u64 {
        self.vm
    }
}

enum Shadow {
    Object(Weak<std::cell::RefCell<GuestObject>>),
    Symbol(Weak<SymbolData>),
}

struct Slot {
    refcount: u32,
    value: Option<GuestValue>,
    shadow: Option<Shadow>,
}

/// Slot storage. Owned by the engine.
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn alloc(&mut self, value: GuestValue) -> u32 {
        let shadow = match &value {
            GuestValue::Object(o) => Some(Shadow::Object(std::rc::Rc::downgrade(o))),
            GuestValue::Symbol(s) => Some(Shadow::Symbol(std::rc::Rc::downgrade(s))),
            _ => None,
        };
        self.slots.push(Slot {
            refcount: 1,
            value: Some(value),
            shadow,
        });
        (self.slots.len() - 1) as u32
    }

    fn slot(&self, idx: u32) -> VmResult<&Slot> {
        self.slots.get(idx as usize).ok_or(VmError::NotAlive)
    }

    pub(crate) fn is_alive(&self, idx: u32) -> bool {
        self.slots
            .get(idx as usize)
            .map(|s| s.refcount > 0)
            .unwrap_or(false)
    }

    pub(crate) fn retain(&mut self, idx: u32) -> VmResult<()> {
        let slot = self
            .slots
            .get_mut(idx as usize)
            .ok_or(VmError::NotAlive)?;
        if slot.refcount == 0 {
            return Err(VmError::NotAlive);
        }
        slot.refcount += 1;
        Ok(())
    }

    pub(crate) fn release(&mut self, idx: u32) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            if slot.refcount > 0 {
                slot.refcount -= 1;
                if slot.refcount == 0 {
                    slot.value = None;
                }
            }
        }
    }

    /// Strong value of a live slot
    pub(crate) fn value(&self, idx: u32) -> VmResult<GuestValue> {
        let slot = self.slot(idx)?;
        slot.value.clone().ok_or(VmError::NotAlive)
    }

    /// Value of a slot even after release, via the weak shadow. `None`
    /// when the underlying guest value has been collected or the slot
    /// never held an object-shaped value.
    pub(crate) fn shadow_value(&self, idx: u32) -> Option<GuestValue> {
        let slot = self.slots.get(idx as usize)?;
        if let Some(v) = &slot.value {
            return Some(v.clone());
        }
        match slot.shadow.as_ref()? {
            Shadow::Object(w) => w.upgrade().map(GuestValue::Object),
            Shadow::Symbol(w) => w.upgrade().map(GuestValue::Symbol),
        }
    }

    /// Number of live slots (diagnostics)
    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount > 0).count()
    }
}
