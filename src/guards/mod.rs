//! Filesystem confinement and per-user disk quotas, consulted before any
//! privileged operation (spawning, shell sessions, file access).

mod path;
mod quota;

pub use path::{resolve_against, resolve_path, PathGuard};
pub use quota::{QuotaInfo, UserRoots};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("{context} is required")]
    Missing { context: String },

    #[error("{context} must stay within SHELL_ROOT ({root})")]
    OutsideRoot { context: String, root: String },

    #[error("Configured SHELL_ROOT does not exist: {root}")]
    RootMissing { root: String },

    #[error("User is over disk quota")]
    OverQuota(QuotaInfo),

    #[error("Failed to prepare user root {root}: {source}")]
    UserRoot {
        root: String,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    /// HTTP-style status code for the violation
    pub fn status(&self) -> u16 {
        match self {
            GuardError::Missing { .. } | GuardError::RootMissing { .. } => 400,
            GuardError::OutsideRoot { .. } | GuardError::OverQuota(_) => 403,
            GuardError::UserRoot { .. } => 500,
        }
    }

    /// Machine-readable code, only set for quota violations
    pub fn code(&self) -> Option<&'static str> {
        match self {
            GuardError::OverQuota(_) => Some("OVER_QUOTA"),
            _ => None,
        }
    }
}
