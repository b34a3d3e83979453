//! Minimal handle-based guest script engine.
//!
//! The engine runs a small script language in an isolated heap and
//! exposes every capability an embedder needs through opaque,
//! reference-counted [`GuestHandle`]s: value construction and
//! introspection, full property-descriptor access, calls and
//! construction, proxies with native traps, promises with an explicit
//! pending-job queue, and weak identity tags for mapping guest values to
//! external bookkeeping.
//!
//! The engine is strictly single-threaded. Nothing runs behind the
//! embedder's back: promise continuations only fire when
//! [`Vm::execute_pending_jobs`] is called.

mod error;
mod handle;
mod interp;
mod lexer;
mod object;
mod parser;
mod promise;
mod proxy;
mod value;
mod vm;

pub use error::{VmError, VmResult};
pub use handle::GuestHandle;
pub use object::{NativeFn, PropertyAttributes, PropertyKey};
pub use vm::{GuestPropertyDescriptor, NativeCall, ProxyTrapHandles, Vm};
