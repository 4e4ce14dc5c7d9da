use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} already has a running process")]
    Busy(String),
}

/// Information about a live CLI invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub run_id: i64,
    pub session_key: String,
    /// Set once the subprocess has actually started
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub cwd: String,
    pub model: String,
}

/// Registry entry: metadata plus the token that stops the invocation
struct ProcessHandle {
    info: ProcessInfo,
    cancel: CancellationToken,
}

/// Ticket held by the invocation that reserved a registry slot
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_key: String,
    pub run_id: i64,
    /// Cancelled by abort; the invocation terminates its child when it fires
    pub cancel: CancellationToken,
}

/// Registry of live CLI processes keyed by session ID.
/// Owned by one orchestrator; independent instances never share entries.
pub struct ProcessRegistry {
    processes: DashMap<String, ProcessHandle>,
    next_id: AtomicI64,
    single_flight: bool,
}

impl ProcessRegistry {
    pub fn new(single_flight: bool) -> Self {
        Self {
            processes: DashMap::new(),
            next_id: AtomicI64::new(1000000),
            single_flight,
        }
    }

    /// Reserve the slot for `session_key` before the subprocess is spawned.
    /// With single-flight enabled a live entry for the same key is an error;
    /// otherwise the newer invocation takes the slot over.
    pub fn reserve(
        &self,
        session_key: &str,
        cwd: &str,
        model: &str,
    ) -> Result<Registration, RegistryError> {
        self.insert(session_key, cwd, model, !self.single_flight)
    }

    /// Reserve a freshly allocated key; never takes over an existing entry
    pub fn reserve_vacant(
        &self,
        session_key: &str,
        cwd: &str,
        model: &str,
    ) -> Result<Registration, RegistryError> {
        self.insert(session_key, cwd, model, false)
    }

    fn insert(
        &self,
        session_key: &str,
        cwd: &str,
        model: &str,
        allow_takeover: bool,
    ) -> Result<Registration, RegistryError> {
        let run_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = ProcessHandle {
            info: ProcessInfo {
                run_id,
                session_key: session_key.to_string(),
                pid: None,
                started_at: Utc::now(),
                cwd: cwd.to_string(),
                model: model.to_string(),
            },
            cancel: cancel.clone(),
        };

        match self.processes.entry(session_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !allow_takeover {
                    warn!("Session {} already has a live process", session_key);
                    return Err(RegistryError::Busy(session_key.to_string()));
                }
                warn!(
                    "Session {} already running as run_id {}, replacing registry entry",
                    session_key,
                    occupied.get().info.run_id
                );
                occupied.insert(handle);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
            }
        }

        info!("Registered session {} with run_id {}", session_key, run_id);
        Ok(Registration {
            session_key: session_key.to_string(),
            run_id,
            cancel,
        })
    }

    /// Record the PID once the child is running
    pub fn set_pid(&self, registration: &Registration, pid: u32) {
        if let Some(mut handle) = self.processes.get_mut(&registration.session_key) {
            if handle.info.run_id == registration.run_id {
                handle.info.pid = Some(pid);
            }
        }
    }

    /// Drop the entry if it still belongs to this registration
    pub fn unregister(&self, registration: &Registration) -> bool {
        let removed = self
            .processes
            .remove_if(&registration.session_key, |_, handle| {
                handle.info.run_id == registration.run_id
            })
            .is_some();
        if removed {
            debug!(
                "Unregistered session {} (run_id {})",
                registration.session_key, registration.run_id
            );
        }
        removed
    }

    /// Abort the invocation registered under exactly `session_key`.
    /// The entry is gone when this returns; unknown keys return false.
    pub fn abort(&self, session_key: &str) -> bool {
        match self.processes.remove(session_key) {
            Some((_, handle)) => {
                info!(
                    "Aborting session {} (run_id {}, pid {:?})",
                    session_key, handle.info.run_id, handle.info.pid
                );
                handle.cancel.cancel();
                true
            }
            None => {
                debug!("No running process for session {}", session_key);
                false
            }
        }
    }

    /// Abort every live invocation, returning how many were stopped
    pub fn abort_all(&self) -> usize {
        let keys: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        let count = keys.iter().filter(|key| self.abort(key)).count();
        if count > 0 {
            info!("Aborted {} running processes", count);
        }
        count
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.processes.contains_key(session_key)
    }

    pub fn get(&self, session_key: &str) -> Option<ProcessInfo> {
        self.processes.get(session_key).map(|h| h.info.clone())
    }

    pub fn running(&self) -> Vec<ProcessInfo> {
        self.processes.iter().map(|h| h.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Send SIGTERM, then SIGKILL if the child is still alive after `grace`
pub async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let pid = child.id();
    match pid {
        Some(pid) if send_terminate(pid) => {
            info!("Sent SIGTERM to PID {}", pid);
        }
        _ => {
            // No graceful signal available; go straight to kill
            child.start_kill()?;
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "Process {:?} still alive {}ms after SIGTERM, sending SIGKILL",
                pid,
                grace.as_millis()
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}
