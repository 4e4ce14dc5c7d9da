use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CONTEXT_HEADER: &str = "Here is the conversation history:\n\n";
const CONTEXT_TRAILER: &str =
    "\nBased on the above conversation history, please answer the following question:\n";
const SUMMARY_MAX_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize session {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid session id: {0}")]
    InvalidId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A single chat message; immutable once appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation persisted as one JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Listing entry for a project's sessions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub summary: String,
    pub message_count: usize,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    fn new(id: String, project_path: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_path,
            messages: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    fn summary(&self) -> SessionSummary {
        let summary = self
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_summary(&m.content))
            .unwrap_or_else(|| "New Session".to_string());
        SessionSummary {
            id: self.id.clone(),
            summary,
            message_count: self.messages.len(),
            last_activity: self.last_activity,
        }
    }
}

fn truncate_summary(content: &str) -> String {
    if content.chars().count() > SUMMARY_MAX_CHARS {
        let head: String = content.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

/// Session store: in-memory map with write-through persistence, one file per session
pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuild the in-memory map from disk. Unreadable files are skipped.
    pub async fn load_all(&self) -> Result<usize, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut loaded = HashMap::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<Session>(&contents) {
                    Ok(session) => {
                        loaded.insert(session.id.clone(), session);
                    }
                    Err(e) => warn!("Skipping malformed session file {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read session file {:?}: {}", path, e),
            }
        }

        let count = loaded.len();
        *self.sessions.write().await = loaded;
        info!("Loaded {} sessions from {:?}", count, self.dir);
        Ok(count)
    }

    /// Create a session, or return the existing one with the same id
    pub async fn create_session(
        &self,
        id: &str,
        project_path: &str,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            return Ok(existing.clone());
        }
        let session = Session::new(id.to_string(), project_path.to_string());
        self.persist(&session).await?;
        sessions.insert(id.to_string(), session.clone());
        info!("Created session {} for project {}", id, project_path);
        Ok(session)
    }

    /// Append a message, creating the session if needed
    pub async fn add_message(
        &self,
        id: &str,
        role: Role,
        content: &str,
        project_path: &str,
    ) -> Result<Session, StoreError> {
        self.session_path(id)?;
        let mut sessions = self.sessions.write().await;
        let mut session = sessions
            .get(id)
            .cloned()
            .unwrap_or_else(|| Session::new(id.to_string(), project_path.to_string()));

        let now = Utc::now();
        session.messages.push(Message {
            role,
            content: content.to_string(),
            timestamp: now,
        });
        session.last_activity = now;

        // Memory only changes once the file is written
        self.persist(&session).await?;
        sessions.insert(id.to_string(), session.clone());
        debug!("Appended {:?} message to session {}", role, id);
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Sessions of a project, most recent activity first
    pub async fn list_sessions_for_project(&self, project_path: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.project_path == project_path)
            .map(Session::summary)
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    /// Render the last `max_messages` as a transcript to prepend to a prompt
    pub async fn build_context(&self, id: &str, max_messages: usize) -> String {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(id) else {
            return String::new();
        };
        if session.messages.is_empty() || max_messages == 0 {
            return String::new();
        }

        let start = session.messages.len().saturating_sub(max_messages);
        let mut context = String::from(CONTEXT_HEADER);
        for message in &session.messages[start..] {
            context.push_str(message.role.label());
            context.push_str(": ");
            context.push_str(&message.content);
            context.push('\n');
        }
        context.push_str(CONTEXT_TRAILER);
        context
    }

    /// Messages in the format the chat history view renders
    pub async fn get_session_messages(&self, id: &str) -> Vec<Value> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(id) else {
            return Vec::new();
        };
        session
            .messages
            .iter()
            .map(|m| {
                json!({
                    "type": "message",
                    "message": { "role": m.role, "content": m.content },
                    "timestamp": m.timestamp.to_rfc3339(),
                })
            })
            .collect()
    }

    /// Remove a session from memory and disk. Returns whether it existed.
    pub async fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.session_path(id)?;
        let existed = self.sessions.write().await.remove(id).is_some();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        if existed {
            info!("Deleted session {}", id);
        }
        Ok(existed)
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(&session.id)?;
        let contents =
            serde_json::to_string_pretty(session).map_err(|source| StoreError::Serialize {
                id: session.id.clone(),
                source,
            })?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }
}
