/// Process management for CLI invocations
/// Tracks one live process per session key and owns the abort/terminate path

pub mod registry;

pub use registry::{
    terminate_child,
    ProcessInfo,
    ProcessRegistry,
    Registration,
    RegistryError,
};
