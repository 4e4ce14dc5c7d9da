use std::path::{Component, Path, PathBuf};

use super::GuardError;

/// Lexically resolve `path` against the current directory, collapsing `.` and `..`
/// without touching the filesystem.
pub fn resolve_path(path: &Path) -> PathBuf {
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };
    resolve_against(&base, path)
}

/// Lexically resolve `path` against `base`
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    let joined;
    let full = if path.is_absolute() {
        path
    } else {
        joined = base.join(path);
        joined.as_path()
    };
    for component in full.components() {
        match component {
            Component::Prefix(prefix) => resolved.push(prefix.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => resolved.push(part),
        }
    }
    resolved
}

/// Confines paths to a configured root. With no root configured everything is allowed.
#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    root: Option<PathBuf>,
}

impl PathGuard {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root.map(|r| resolve_path(&r)),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// True iff the resolved path equals the root or lies beneath it
    pub fn is_within_root(&self, path: impl AsRef<Path>) -> bool {
        let Some(root) = &self.root else {
            return true;
        };
        let resolved = resolve_path(path.as_ref());
        // Component-wise prefix: "/data/alice" is not under "/data/al"
        resolved.starts_with(root)
    }

    pub fn assert_within_root(&self, path: &str, context: &str) -> Result<(), GuardError> {
        if path.is_empty() {
            return Err(GuardError::Missing {
                context: context.to_string(),
            });
        }
        let Some(root) = &self.root else {
            return Ok(());
        };
        if !self.is_within_root(path) {
            return Err(GuardError::OutsideRoot {
                context: context.to_string(),
                root: root.display().to_string(),
            });
        }
        Ok(())
    }

    /// Fails if a root is configured but missing on disk
    pub fn ensure_root_exists(&self) -> Result<(), GuardError> {
        match &self.root {
            Some(root) if !root.exists() => Err(GuardError::RootMissing {
                root: root.display().to_string(),
            }),
            _ => Ok(()),
        }
    }
}
