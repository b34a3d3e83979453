//! Bridge error types

use pontoon_vm::VmError;
use thiserror::Error;

use crate::host::HostValue;

/// Errors raised by the bridge. `AlreadyRegistered` and `VmMismatch`
/// indicate identity-table corruption and are never silently recovered.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A host or guest object is being bound to a second, different
    /// counterpart
    #[error("value is already registered")]
    AlreadyRegistered,

    /// A disposed guest handle was used
    #[error("handle is not alive")]
    HandleNotAlive,

    /// A handle or map from one engine instance was used with another
    #[error("vm and map do not match")]
    VmMismatch,

    /// The arena has been disposed
    #[error("arena is disposed")]
    Disposed,

    /// A script value was thrown across the boundary; `value` is the
    /// unmarshaled thrown value
    #[error("uncaught exception: {message}")]
    Exception {
        /// The thrown value, unmarshaled to the host side
        value: HostValue,
        /// Best-effort rendering of the thrown value
        message: String,
    },

    /// A host-side callable failed
    #[error("{0}")]
    Host(String),

    /// Engine error passthrough
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl BridgeError {
    /// Wrap a thrown value
    pub fn exception(value: HostValue) -> Self {
        let message = value.render();
        Self::Exception { value, message }
    }

    /// Host-side failure with a message
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
