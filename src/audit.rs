use chrono::Utc;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::guards::UserRoots;

/// Appends per-user audit events as JSON lines under `<user_root>/logs/<uid>-<date>.log`
#[derive(Debug, Clone)]
pub struct AuditLog {
    roots: UserRoots,
}

impl AuditLog {
    pub fn new(roots: UserRoots) -> Self {
        Self { roots }
    }

    pub fn log_path(&self, uid: &str) -> PathBuf {
        let uid = if uid.is_empty() { "anonymous" } else { uid };
        let date = Utc::now().format("%Y-%m-%d");
        self.roots
            .user_root(uid)
            .join("logs")
            .join(format!("{}-{}.log", uid, date))
    }

    /// Best-effort append; failures are logged and swallowed
    pub async fn log_user_event(&self, uid: &str, event: &str, payload: Value) {
        let mut record = Map::new();
        record.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        record.insert("uid".into(), Value::String(uid.to_string()));
        record.insert("event".into(), Value::String(event.to_string()));
        if let Value::Object(fields) = payload {
            record.extend(fields);
        }

        let path = self.log_path(uid);
        if let Err(e) = append_line(&path, &Value::Object(record).to_string()).await {
            warn!("Failed to write audit event {} for {}: {}", event, uid, e);
        }
    }
}

async fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}
