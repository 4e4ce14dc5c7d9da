use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::GuardError;

/// Usage snapshot attached to quota violations
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QuotaInfo {
    pub used: u64,
    pub limit: u64,
}

/// Per-user directory roots under a base path, with a disk quota
#[derive(Debug, Clone)]
pub struct UserRoots {
    base: PathBuf,
    quota_bytes: u64,
}

impl UserRoots {
    pub fn new(base: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            base: base.into(),
            quota_bytes,
        }
    }

    pub fn quota_limit(&self) -> u64 {
        self.quota_bytes
    }

    pub fn user_root(&self, uid: &str) -> PathBuf {
        let uid = if uid.is_empty() { "anonymous" } else { uid };
        self.base.join(uid)
    }

    /// Create the user's root and its standard sub-directories
    pub fn ensure_user_root(&self, uid: &str) -> Result<PathBuf, GuardError> {
        let root = self.user_root(uid);
        let subdirs = [
            root.clone(),
            root.join(".gemini"),
            root.join(".gemini").join("projects"),
            root.join("tmp"),
            root.join("logs"),
        ];
        for dir in &subdirs {
            std::fs::create_dir_all(dir).map_err(|source| GuardError::UserRoot {
                root: root.display().to_string(),
                source,
            })?;
        }
        Ok(root)
    }

    /// Bytes used under the user's root, recomputed by a full walk
    pub fn quota_usage_bytes(&self, uid: &str) -> u64 {
        dir_size(&self.user_root(uid))
    }

    pub fn is_over_quota(&self, uid: &str) -> bool {
        self.quota_usage_bytes(uid) >= self.quota_bytes
    }

    pub fn quota_guard(&self, uid: &str) -> Result<(), GuardError> {
        let used = self.quota_usage_bytes(uid);
        if used >= self.quota_bytes {
            warn!("User {} over quota: {} >= {}", uid, used, self.quota_bytes);
            return Err(GuardError::OverQuota(QuotaInfo {
                used,
                limit: self.quota_bytes,
            }));
        }
        debug!("Quota ok for {}: {} / {}", uid, used, self.quota_bytes);
        Ok(())
    }
}

fn dir_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_user_root_layout() {
        let base = TempDir::new().unwrap();
        let roots = UserRoots::new(base.path(), 1_000);
        let root = roots.ensure_user_root("alice").unwrap();
        assert_eq!(root, base.path().join("alice"));
        assert!(root.join(".gemini/projects").is_dir());
        assert!(root.join("tmp").is_dir());
        assert!(root.join("logs").is_dir());
        assert_eq!(roots.user_root(""), base.path().join("anonymous"));
    }

    #[test]
    fn test_quota_walk_and_guard() {
        let base = TempDir::new().unwrap();
        let roots = UserRoots::new(base.path(), 100);
        let root = roots.ensure_user_root("bob").unwrap();
        std::fs::write(root.join("a.txt"), vec![0u8; 40]).unwrap();
        std::fs::write(root.join("tmp/b.bin"), vec![0u8; 30]).unwrap();

        assert_eq!(roots.quota_usage_bytes("bob"), 70);
        assert!(roots.quota_guard("bob").is_ok());

        std::fs::write(root.join("logs/c.log"), vec![0u8; 30]).unwrap();
        let err = roots.quota_guard("bob").unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(err.code(), Some("OVER_QUOTA"));
        match err {
            GuardError::OverQuota(info) => assert_eq!(info, QuotaInfo { used: 100, limit: 100 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_root_is_empty() {
        let base = TempDir::new().unwrap();
        let roots = UserRoots::new(base.path(), 10);
        assert_eq!(roots.quota_usage_bytes("ghost"), 0);
        assert!(!roots.is_over_quota("ghost"));
    }
}
