use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::attachments::{ImageAttachment, SavedImages};
use crate::audit::AuditLog;
use crate::billing::{BillingError, Biller, LedgerSummary, UsageReporter};
use crate::caller::Caller;
use crate::cli_command::{
    default_mcp_config_path, detect_mcp_config, resolve_binary, sanitize_cwd, CliInvocation,
};
use crate::config::CliConfig;
use crate::events::{EventSink, ServerEvent};
use crate::guards::{GuardError, PathGuard, UserRoots};
use crate::process::{terminate_child, ProcessInfo, ProcessRegistry, Registration, RegistryError};
use crate::session_store::{Role, SessionStore};
use crate::stream_parser::{
    classify_line, is_stderr_noise, LineSplitter, ProtocolStats, ResponseAccumulator, StdoutLine,
};

/// Error text sent when the CLI goes quiet for longer than the output timeout
pub const TIMEOUT_MESSAGE: &str = "Gemini CLI timeout - no response received";

/// How long to wait for the output readers after the child has exited
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("Photon charge failed: {0}")]
    Billing(#[from] BillingError),
    #[error(transparent)]
    SessionBusy(#[from] RegistryError),
    #[error("Failed to spawn Gemini CLI: {0}")]
    Spawn(std::io::Error),
    #[error("Gemini CLI exited with code {}", display_code(.0))]
    Exited(Option<i32>),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "null".to_string())
}

/// Per-command tool settings sent by the client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsSettings {
    pub skip_permissions: bool,
}

/// Options accompanying a chat command
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandOptions {
    /// Resume this session; absent for a new one
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub debug: bool,
    pub images: Vec<ImageAttachment>,
    pub tools_settings: ToolsSettings,
}

/// Result of an invocation that exited cleanly
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub session_id: String,
    pub is_new_session: bool,
    pub exit_code: Option<i32>,
    pub billing: LedgerSummary,
    pub stats: ProtocolStats,
}

/// Releases the registry slot however the invocation ends
struct RegistrationGuard<'a> {
    registry: &'a ProcessRegistry,
    registration: Registration,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.registration);
    }
}

/// Spawns the Gemini CLI for chat commands, streams its output to a sink,
/// persists the conversation and meters token usage.
pub struct GeminiSpawner {
    cli: CliConfig,
    binary: String,
    registry: Arc<ProcessRegistry>,
    sessions: Arc<SessionStore>,
    biller: Biller,
    paths: PathGuard,
    users: UserRoots,
    audit: AuditLog,
}

impl GeminiSpawner {
    pub fn new(
        cli: CliConfig,
        sessions: Arc<SessionStore>,
        biller: Biller,
        paths: PathGuard,
        users: UserRoots,
    ) -> Self {
        let binary = resolve_binary(&cli.binary);
        info!("Using Gemini CLI binary: {}", binary);
        Self {
            registry: Arc::new(ProcessRegistry::new(cli.single_flight)),
            audit: AuditLog::new(users.clone()),
            cli,
            binary,
            sessions,
            biller,
            paths,
            users,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn biller(&self) -> &Biller {
        &self.biller
    }

    pub fn paths(&self) -> &PathGuard {
        &self.paths
    }

    pub fn users(&self) -> &UserRoots {
        &self.users
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn running(&self) -> Vec<ProcessInfo> {
        self.registry.running()
    }

    /// Abort the invocation for exactly `session_id`
    pub fn abort(&self, session_id: &str) -> bool {
        self.registry.abort(session_id)
    }

    pub fn abort_all(&self) -> usize {
        self.registry.abort_all()
    }

    /// Run one command to completion. Events go to `sink` as they happen;
    /// the returned error mirrors what the client has already been told.
    pub async fn spawn_invocation(
        &self,
        command: &str,
        options: CommandOptions,
        caller: &Caller,
        sink: Arc<dyn EventSink>,
    ) -> Result<InvocationOutcome, InvocationError> {
        let cwd = options
            .cwd
            .as_deref()
            .or(options.project_path.as_deref())
            .and_then(sanitize_cwd)
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|dir| dir.display().to_string())
            })
            .unwrap_or_else(|| ".".to_string());

        self.paths.ensure_root_exists()?;
        self.paths.assert_within_root(&cwd, "Working directory")?;
        self.users.quota_guard(&caller.uid)?;

        let model = options
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.cli.default_model.clone());
        let resume_id = options.session_id.clone().filter(|id| !id.is_empty());
        let is_new = resume_id.is_none();

        let (session_id, registration) = match resume_id {
            Some(id) => {
                let registration = match self.registry.reserve(&id, &cwd, &model) {
                    Ok(registration) => registration,
                    Err(e) => {
                        sink.send(ServerEvent::GeminiError {
                            error: e.to_string(),
                        });
                        return Err(e.into());
                    }
                };
                (id, registration)
            }
            None => self.allocate_session(&cwd, &model).await,
        };
        let slot = RegistrationGuard {
            registry: &self.registry,
            registration: registration.clone(),
        };

        info!(
            "Gemini command for session {} (new: {}, cwd: {}, model: {})",
            session_id, is_new, cwd, model
        );
        self.audit
            .log_user_event(
                &caller.uid,
                "command_received",
                json!({
                    "sessionId": session_id,
                    "isNewSession": is_new,
                    "cwd": cwd,
                    "model": model,
                    "commandLength": command.len(),
                }),
            )
            .await;

        // The flat fee must clear before anything is spawned
        let ledger = self.biller.open(caller, sink.clone());
        ledger.charge_message().await?;

        let mut prompt = command.to_string();
        if !is_new && !command.is_empty() {
            let context = self
                .sessions
                .build_context(&session_id, self.cli.context_messages)
                .await;
            prompt = format!("{}{}", context, command);
        }

        let images = match SavedImages::persist(Path::new(&cwd), &options.images).await {
            Ok(images) => images,
            Err(e) => {
                warn!("Failed to save attached images: {}", e);
                SavedImages::default()
            }
        };
        if !command.is_empty() {
            if let Some(note) = images.prompt_note() {
                prompt.push_str(&note);
            }
        }

        let mcp_config = self
            .cli
            .mcp_config_path
            .clone()
            .or_else(default_mcp_config_path)
            .and_then(|path| detect_mcp_config(&path, Path::new(&cwd)));

        let invocation = CliInvocation {
            prompt,
            model: model.clone(),
            debug: options.debug,
            skip_permissions: options.tools_settings.skip_permissions,
            mcp_config,
        };
        let mut cmd = invocation.build_command(&self.binary, Path::new(&cwd));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn Gemini CLI: {}", e);
                sink.send(ServerEvent::GeminiError {
                    error: e.to_string(),
                });
                images.cleanup().await;
                return Err(InvocationError::Spawn(e));
            }
        };
        if let Some(pid) = child.id() {
            info!("Spawned Gemini CLI with PID {} for {}", pid, session_id);
            self.registry.set_pid(&registration, pid);
        }

        if !is_new && !command.is_empty() {
            if let Err(e) = self
                .sessions
                .add_message(&session_id, Role::User, command, &cwd)
                .await
            {
                warn!("Failed to persist user message for {}: {}", session_id, e);
            }
        }

        if self.biller.config().fatal_on_billing_error {
            let registry = self.registry.clone();
            let registration = registration.clone();
            ledger.set_abort_hook(Arc::new(move || {
                registry.unregister(&registration);
                registration.cancel.cancel();
            }));
        }
        let (reporter, metering) = ledger.start_metering();
        let activity = Arc::new(Notify::new());

        let mut stdout_task = tokio::spawn(pump_stdout(
            child.stdout.take(),
            StdoutContext {
                sink: sink.clone(),
                sessions: self.sessions.clone(),
                audit: self.audit.clone(),
                uid: caller.uid.clone(),
                session_id: session_id.clone(),
                cwd: cwd.clone(),
                command: command.to_string(),
                announce: is_new,
                reporter,
                activity: activity.clone(),
            },
        ));
        let mut stderr_task = tokio::spawn(pump_stderr(
            child.stderr.take(),
            sink.clone(),
            activity.clone(),
        ));

        let output_timeout = self.cli.output_timeout();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = registration.cancel.cancelled() => {
                    info!("Terminating Gemini CLI for session {}", session_id);
                    break terminate_child(&mut child, self.cli.abort_grace()).await;
                }
                _ = activity.notified() => continue,
                _ = idle_timer(output_timeout) => {
                    warn!("No output from Gemini CLI for session {}, aborting", session_id);
                    sink.send(ServerEvent::GeminiError {
                        error: TIMEOUT_MESSAGE.to_string(),
                    });
                    self.registry.unregister(&registration);
                    registration.cancel.cancel();
                }
            }
        };
        let exit_code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Failed waiting for Gemini CLI: {}", e);
                None
            }
        };
        info!(
            "Gemini CLI for session {} exited with code {:?}",
            session_id, exit_code
        );

        let (response, stats) = drain(&mut stdout_task).await.unwrap_or_default();
        let _ = drain(&mut stderr_task).await;
        drop(slot);

        if !response.is_empty() {
            if let Err(e) = self
                .sessions
                .add_message(&session_id, Role::Assistant, &response.text(), &cwd)
                .await
            {
                warn!("Failed to persist assistant reply for {}: {}", session_id, e);
            }
        }

        let billing = metering.finish().await;
        debug!("Protocol stats for {}: {:?}", session_id, stats);

        let is_new_session = is_new && !command.is_empty();
        sink.send(ServerEvent::GeminiComplete {
            exit_code,
            is_new_session,
        });
        images.cleanup().await;

        self.audit
            .log_user_event(
                &caller.uid,
                "invocation_complete",
                json!({
                    "sessionId": session_id,
                    "exitCode": exit_code,
                    "totalTokens": billing.total_tokens,
                    "billedTokens": billing.billed_tokens,
                    "failedTokens": billing.failed_tokens,
                    "photonsCharged": billing.photons_charged,
                    "billingStatus": billing.status,
                }),
            )
            .await;

        if exit_code == Some(0) {
            Ok(InvocationOutcome {
                session_id,
                is_new_session,
                exit_code,
                billing,
                stats,
            })
        } else {
            Err(InvocationError::Exited(exit_code))
        }
    }

    /// Pick `<prefix>_<epoch-ms>` for a new session, bumping the suffix until
    /// neither the store nor the registry knows it, and reserve it.
    async fn allocate_session(&self, cwd: &str, model: &str) -> (String, Registration) {
        let mut millis = chrono::Utc::now().timestamp_millis();
        loop {
            let id = format!("{}_{}", self.cli.session_prefix, millis);
            millis += 1;
            if self.sessions.contains(&id).await {
                continue;
            }
            if let Ok(registration) = self.registry.reserve_vacant(&id, cwd, model) {
                return (id, registration);
            }
        }
    }

    /// One-shot CLI run that returns the generated document from stdout
    pub async fn generate_spec(&self, kind: &str, context: &str) -> Result<String, InvocationError> {
        let prompt = format!(
            "Generate a {} for a new feature. Here is the context:\n\n{}",
            kind, context
        );
        info!("Generating {} with Gemini CLI", kind);

        let output = Command::new(&self.binary)
            .arg("--prompt")
            .arg(&prompt)
            .arg("--model")
            .arg(&self.cli.default_model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(InvocationError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Spec generation failed: {}", stderr.trim());
            return Err(InvocationError::Exited(output.status.code()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Resolves after `timeout`, or never when no timeout is configured
async fn idle_timer(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

/// Wait for a reader task; a reader still blocked after the drain timeout
/// (a grandchild holding the pipe) is cancelled.
async fn drain<T>(task: &mut JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut *task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!("Output reader task failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Output reader still open after exit, cancelling");
            task.abort();
            None
        }
    }
}

struct StdoutContext {
    sink: Arc<dyn EventSink>,
    sessions: Arc<SessionStore>,
    audit: AuditLog,
    uid: String,
    session_id: String,
    cwd: String,
    command: String,
    /// New sessions are created and announced on the first stdout chunk
    announce: bool,
    reporter: UsageReporter,
    activity: Arc<Notify>,
}

impl StdoutContext {
    async fn announce_session(&mut self) {
        self.announce = false;
        if let Err(e) = self
            .sessions
            .create_session(&self.session_id, &self.cwd)
            .await
        {
            warn!("Failed to create session {}: {}", self.session_id, e);
        }
        if !self.command.is_empty() {
            if let Err(e) = self
                .sessions
                .add_message(&self.session_id, Role::User, &self.command, &self.cwd)
                .await
            {
                warn!(
                    "Failed to persist user message for {}: {}",
                    self.session_id, e
                );
            }
        }
        self.sink.send(ServerEvent::SessionCreated {
            session_id: self.session_id.clone(),
        });
        self.audit
            .log_user_event(
                &self.uid,
                "session_created",
                json!({ "sessionId": self.session_id, "cwd": self.cwd }),
            )
            .await;
    }

    fn handle_line(
        &self,
        line: &str,
        stats: &mut ProtocolStats,
        response: &mut ResponseAccumulator,
    ) {
        let classified = classify_line(line);
        stats.record(&classified);
        match classified {
            StdoutLine::Response(parsed) => {
                if let Some(total) = parsed.total_tokens {
                    self.reporter.observe(total);
                }
                if let Some(text) = parsed.text {
                    response.push(text);
                }
                self.sink.send_json(parsed.raw);
            }
            StdoutLine::Untagged | StdoutLine::Unparseable => {
                debug!("Dropping stdout line: {}", truncate(line, 200));
            }
            StdoutLine::Blank | StdoutLine::Noise => {}
        }
    }
}

async fn pump_stdout(
    stdout: Option<ChildStdout>,
    mut ctx: StdoutContext,
) -> (ResponseAccumulator, ProtocolStats) {
    let mut response = ResponseAccumulator::default();
    let mut stats = ProtocolStats::default();
    let Some(mut stdout) = stdout else {
        return (response, stats);
    };

    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                warn!("Error reading Gemini stdout: {}", e);
                break;
            }
        };
        ctx.activity.notify_one();
        if ctx.announce {
            ctx.announce_session().await;
        }
        for line in splitter.push(&buf[..read]) {
            ctx.handle_line(&line, &mut stats, &mut response);
        }
    }
    if let Some(rest) = splitter.finish() {
        ctx.handle_line(&rest, &mut stats, &mut response);
    }

    if stats.unparseable > 0 {
        warn!(
            "Session {}: {} unparseable stdout lines, {} untagged, {} schema mismatches",
            ctx.session_id, stats.unparseable, stats.untagged, stats.schema_mismatch
        );
    } else if stats.untagged + stats.schema_mismatch > 0 {
        debug!(
            "Session {}: {} untagged, {} schema mismatches",
            ctx.session_id, stats.untagged, stats.schema_mismatch
        );
    }
    (response, stats)
}

async fn pump_stderr(stderr: Option<ChildStderr>, sink: Arc<dyn EventSink>, activity: Arc<Notify>) {
    let Some(stderr) = stderr else {
        return;
    };
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                activity.notify_one();
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() || is_stderr_noise(line) {
                    continue;
                }
                warn!("Gemini stderr: {}", line);
                sink.send(ServerEvent::GeminiError {
                    error: line.to_string(),
                });
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading Gemini stderr: {}", e);
                break;
            }
        }
    }
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
