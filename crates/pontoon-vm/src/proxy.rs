//! Guest proxies
//!
//! A proxy wraps a target value and routes property operations through
//! native trap functions. The bridge installs these to intercept guest
//! mutations of synchronized mirrors; absent traps fall through to the
//! target.

use crate::value::GuestValue;

/// Trap functions for a proxy. Each is a guest function value (normally a
/// native one). Missing traps fall through to the target object.
#[derive(Clone, Default)]
pub struct ProxyTraps {
    /// `get(target, key)` trap
    pub get: Option<GuestValue>,
    /// `set(target, key, value)` trap; must return a boolean
    pub set: Option<GuestValue>,
    /// `delete(target, key)` trap; must return a boolean
    pub delete: Option<GuestValue>,
}

/// Proxy payload: target plus traps
pub struct ProxyData {
    /// The wrapped value (object-shaped)
    pub target: GuestValue,
    /// Trap table
    pub traps: ProxyTraps,
}

impl ProxyData {
    /// Create a proxy payload
    pub fn new(target: GuestValue, traps: ProxyTraps) -> Self {
        Self { target, traps }
    }

    /// The trap for an operation name, if installed
    pub fn trap(&self, name: &str) -> Option<GuestValue> {
        let trap = match name {
            "get" => &self.traps.get,
            "set" => &self.traps.set,
            "delete" => &self.traps.delete,
            _ => &None,
        };
        trap.clone()
    }
}
