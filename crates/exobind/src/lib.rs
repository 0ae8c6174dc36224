//! # exobind
//!
//! Bindings to the external application backend: typed requests go out through
//! the backend's C entry points, and results come back through trampolines on
//! the backend's own threads.
//!
//! ## Architecture
//!
//! - `wire`: the `#[repr(C)]` layouts shared with the backend.
//! - `registry`: token to callback table with exactly-once consumption.
//! - `backend`: the entry points as a trait (`native` links the real library,
//!   `mock` runs in-process).
//! - `bindings`: request functions and trampolines.

pub mod backend;
pub mod bindings;
pub mod mock;
#[cfg(feature = "native")]
pub mod native;
pub mod registry;
pub mod wire;


pub use backend::Backend;
pub use bindings::Bindings;
pub use bindings::Teardown;
pub use mock::MockBackend;
pub use mock::Outcome;
#[cfg(feature = "native")]
pub use native::NativeBackend;
pub use registry::ProtocolViolation;
pub use registry::RegistryStats;
pub use registry::Token;
pub use wire::ApplicationDescriptor;
pub use wire::ConstructionError;
pub use wire::Credential;
pub use wire::OperationResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Construction(ConstructionError),
    RegistryExhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Construction(e) => write!(f, "Construction error: {}", e),
            Self::RegistryExhausted => write!(f, "Registry error: {}", registry::RegistryExhausted),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConstructionError> for Error {
    fn from(e: ConstructionError) -> Self {
        Self::Construction(e)
    }
}

impl From<registry::RegistryExhausted> for Error {
    fn from(_: registry::RegistryExhausted) -> Self {
        Self::RegistryExhausted
    }
}

pub type Result<T> = std::result::Result<T, Error>;
