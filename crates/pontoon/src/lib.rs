//! pontoon bridges two object heaps living in one process: a host-side
//! dynamic value model and a sandboxed guest script engine
//! ([`pontoon_vm`]). Values crossing the boundary keep their identity
//! through a bidirectional map, object graphs (cycles included) mirror
//! faithfully with full property descriptors, and values marked for
//! synchronization propagate mutations live in either direction under a
//! configurable discipline.
//!
//! The entry point is [`Arena`]: evaluate guest code, expose host
//! values as guest globals, mark values for synchronization, and pump
//! the guest's job queue to observe bridged promises.

mod arena;
mod error;
mod host;
mod identity;
mod marshal;
mod sync;
mod transfer;
mod unmarshal;
mod util;

pub use arena::{Arena, Marshalable, Options, Registration};
pub use error::{BridgeError, BridgeResult};
pub use host::{
    HostDescriptor, HostFn, HostKey, HostObject, HostPromise, HostProxyHandler, HostReaction,
    HostSymbol, HostValue, call_value,
};
pub use sync::SyncMode;

pub use pontoon_vm::{GuestHandle, GuestPropertyDescriptor, PropertyAttributes, PropertyKey, Vm};
