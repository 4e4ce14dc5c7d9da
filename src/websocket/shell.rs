use async_trait::async_trait;
use once_cell::sync::Lazy;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::shell_guard::{ShellAction, ShellGuard, CLEAR_LINE};
use super::Channel;
use crate::caller::Caller;
use crate::events::{EventSink, ServerEvent};
use crate::guards::resolve_path;
use crate::state::AppState;

/// Output patterns that mean "open this URL in a browser"
static URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?:xdg-open|open|start)\s+(https?://[^\s\x1b\x07]+)",
        r"OPEN_URL:\s*(https?://[^\s\x1b\x07]+)",
        r"(?i)Opening\s+(https?://[^\s\x1b\x07]+)",
        r"(?i)Visit:\s*(https?://[^\s\x1b\x07]+)",
        r"(?i)View at:\s*(https?://[^\s\x1b\x07]+)",
        r"(?i)Browse to:\s*(https?://[^\s\x1b\x07]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// Index of the `OPEN_URL:` pattern, whose matches are rewritten for display
const OPEN_URL_PATTERN: usize = 1;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ShellRequest {
    Init {
        #[serde(rename = "projectPath", default)]
        project_path: Option<String>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        #[serde(default)]
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

/// Find browser-open signals in a chunk of terminal output.
/// Returns the URLs and the chunk with `OPEN_URL:` markers made readable.
pub fn scan_output(data: &str) -> (Vec<String>, String) {
    let mut urls = Vec::new();
    let mut rewritten = data.to_string();
    for (index, pattern) in URL_PATTERNS.iter().enumerate() {
        for captures in pattern.captures_iter(data) {
            let (Some(whole), Some(url)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            urls.push(url.as_str().to_string());
            if index == OPEN_URL_PATTERN {
                rewritten = rewritten.replacen(
                    whole.as_str(),
                    &format!("🌐 Opening in browser: {}", url.as_str()),
                    1,
                );
            }
        }
    }
    (urls, rewritten)
}

fn red(message: &str) -> String {
    format!("\r\n\x1b[31m{}\x1b[0m\r\n", message)
}

/// A running `bash` attached to a PTY
struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    guard: ShellGuard,
}

impl PtySession {
    fn open(cwd: &Path, size: PtySize, guard: ShellGuard, sink: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let pair = native_pty_system().openpty(size)?;

        let mut builder = CommandBuilder::new("bash");
        builder.cwd(cwd);
        builder.env("TERM", "xterm-256color");
        builder.env("COLORTERM", "truecolor");
        builder.env("FORCE_COLOR", "3");
        builder.env("BROWSER", "echo \"OPEN_URL:\"");

        let mut child = pair.slave.spawn_command(builder)?;
        drop(pair.slave);
        info!("Shell started in {:?} (pid {:?})", cwd, child.process_id());

        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        let killer = child.clone_killer();

        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; 8192];
            let mut carry: Vec<u8> = Vec::new();
            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(e) => {
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                };
                carry.extend_from_slice(&buffer[..read]);
                let text = take_utf8(&mut carry);
                if text.is_empty() {
                    continue;
                }
                let (urls, output) = scan_output(&text);
                for url in urls {
                    debug!("Detected URL to open: {}", url);
                    sink.send(ServerEvent::UrlOpen { url });
                }
                sink.send(ServerEvent::Output { data: output });
            }

            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(e) => {
                    warn!("Failed to reap shell: {}", e);
                    1
                }
            };
            info!("Shell exited with code {}", code);
            sink.send(ServerEvent::Output {
                data: format!("\r\n\x1b[33mProcess exited with code {}\x1b[0m\r\n", code),
            });
        });

        Ok(Self {
            master: pair.master,
            writer,
            killer,
            guard,
        })
    }

    fn write(&mut self, data: &str) {
        if let Err(e) = self
            .writer
            .write_all(data.as_bytes())
            .and_then(|_| self.writer.flush())
        {
            warn!("Failed to write to shell: {}", e);
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(e) = self.master.resize(size) {
            warn!("Failed to resize shell: {}", e);
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            debug!("Shell already gone: {}", e);
        }
    }
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

/// Interactive terminal channel (`/shell`)
pub struct ShellChannel {
    state: AppState,
    caller: Caller,
    sink: Arc<dyn EventSink>,
    session: Option<PtySession>,
}

impl ShellChannel {
    pub fn new(state: AppState, caller: Caller, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state,
            caller,
            sink,
            session: None,
        }
    }

    fn output(&self, data: String) {
        self.sink.send(ServerEvent::Output { data });
    }

    async fn init(&mut self, project_path: Option<String>, cols: Option<u16>, rows: Option<u16>) {
        if let Some(mut previous) = self.session.take() {
            previous.kill();
        }

        let paths = self.state.spawner.paths().clone();
        let project: PathBuf = match project_path.filter(|p| !p.trim().is_empty()) {
            Some(path) => resolve_path(Path::new(&path)),
            None => match paths.root() {
                Some(root) => root.to_path_buf(),
                None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            },
        };

        let users = self.state.spawner.users();
        let checked = paths
            .ensure_root_exists()
            .and_then(|_| {
                paths.assert_within_root(&project.display().to_string(), "Shell working directory")
            })
            .and_then(|_| users.quota_guard(&self.caller.uid));
        if let Err(e) = checked {
            warn!("Rejected shell for {}: {}", self.caller.uid, e);
            self.output(red(&e.to_string()));
            self.state
                .spawner
                .audit()
                .log_user_event(
                    &self.caller.uid,
                    "shell_rejected",
                    json!({ "projectPath": project, "error": e.to_string() }),
                )
                .await;
            return;
        }

        self.output(format!(
            "\x1b[36mTerminal started in: {}\x1b[0m\r\n",
            project.display()
        ));

        let size = PtySize {
            rows: rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
            cols: cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            pixel_width: 0,
            pixel_height: 0,
        };
        let guard = ShellGuard::new(paths, project.clone());
        match PtySession::open(&project, size, guard, self.sink.clone()) {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                error!("Failed to start shell: {}", e);
                self.output(red(&format!("Error: {}", e)));
            }
        }
    }

    async fn input(&mut self, data: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut rejected = Vec::new();
        for action in session.guard.feed(data) {
            match action {
                ShellAction::Write(text) => session.write(&text),
                ShellAction::Reject(message) => {
                    self.sink.send(ServerEvent::Output { data: red(&message) });
                    session.write(CLEAR_LINE);
                    rejected.push(message);
                }
            }
        }
        for message in rejected {
            self.state
                .spawner
                .audit()
                .log_user_event(
                    &self.caller.uid,
                    "shell_rejected",
                    json!({ "error": message }),
                )
                .await;
        }
    }
}

#[async_trait]
impl Channel for ShellChannel {
    async fn on_text(&mut self, text: &str) {
        let payload = match serde_json::from_str::<Value>(text) {
            Ok(payload) => payload,
            Err(e) => {
                self.output(red(&format!("Error: {}", e)));
                return;
            }
        };
        let request = match serde_json::from_value::<ShellRequest>(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring shell message: {}", e);
                return;
            }
        };

        match request {
            ShellRequest::Init {
                project_path,
                cols,
                rows,
            } => self.init(project_path, cols, rows).await,
            ShellRequest::Input { data } => self.input(&data).await,
            ShellRequest::Resize { cols, rows } => {
                if let Some(session) = &self.session {
                    session.resize(cols, rows);
                }
            }
        }
    }

    async fn on_close(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Shell client disconnected, killing shell");
            session.kill();
        }
    }
}
