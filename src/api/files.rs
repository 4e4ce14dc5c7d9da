use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Directories never descended into or listed
const SKIPPED_DIRS: &[&str] = &["node_modules", "dist", "build"];

pub const TREE_DEPTH: usize = 3;

/// One entry of the project file tree
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub size: u64,
    pub modified: Option<String>,
    /// Octal owner/group/other digits, e.g. "644"
    pub permissions: String,
    /// e.g. "rw-r--r--"
    pub permissions_rwx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

/// List `dir` recursively. Directories at `depth < max_depth` get children;
/// unreadable directories yield an empty listing.
pub fn file_tree(dir: &Path, max_depth: usize, depth: usize) -> Vec<FileNode> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut nodes: Vec<FileNode> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if SKIPPED_DIRS.contains(&name.as_str()) {
                return None;
            }
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let metadata = std::fs::metadata(&path).ok();

            let (size, modified, mode) = match &metadata {
                Some(meta) => (
                    meta.len(),
                    meta.modified().ok().map(|time| {
                        DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
                    }),
                    permission_bits(meta),
                ),
                None => (0, None, 0),
            };

            let children = (is_dir && depth < max_depth)
                .then(|| file_tree(&path, max_depth, depth + 1));

            Some(FileNode {
                name,
                path: path.display().to_string(),
                kind: if is_dir {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size,
                modified,
                permissions: format!("{}{}{}", (mode >> 6) & 7, (mode >> 3) & 7, mode & 7),
                permissions_rwx: [(mode >> 6) & 7, (mode >> 3) & 7, mode & 7]
                    .iter()
                    .map(|bits| rwx(*bits))
                    .collect(),
                children,
            })
        })
        .collect();

    nodes.sort_by(|a, b| match (a.kind, b.kind) {
        (NodeKind::Directory, NodeKind::File) => std::cmp::Ordering::Less,
        (NodeKind::File, NodeKind::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
    nodes
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn rwx(bits: u32) -> String {
    let flag = |mask: u32, c: char| if bits & mask != 0 { c } else { '-' };
    [flag(4, 'r'), flag(2, 'w'), flag(1, 'x')].iter().collect()
}
