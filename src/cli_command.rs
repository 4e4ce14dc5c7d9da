use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Arguments for one CLI invocation, rendered as an argument vector
#[derive(Debug, Clone, Default)]
pub struct CliInvocation {
    /// Full prompt text (context and image notes already applied)
    pub prompt: String,
    pub model: String,
    pub debug: bool,
    /// Maps to `--yolo`
    pub skip_permissions: bool,
    pub mcp_config: Option<PathBuf>,
}

impl CliInvocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.prompt.is_empty() {
            args.push("--prompt".to_string());
            args.push(self.prompt.clone());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        if let Some(config) = &self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(config.display().to_string());
        }
        args.push("--model".to_string());
        args.push(self.model.clone());
        if self.skip_permissions {
            args.push("--yolo".to_string());
        }
        args
    }

    /// Build the command: argv only, inherited environment, stdin closed
    pub fn build_command(&self, binary: &str, cwd: &Path) -> Command {
        let mut cmd = Command::new(binary);
        let args = self.args();
        debug!("CLI args: {:?}", args);
        cmd.args(&args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Resolve the CLI binary: explicit paths are used as-is, bare names go through PATH
pub fn resolve_binary(binary: &str) -> String {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return binary.to_string();
    }
    match which::which(binary) {
        Ok(path) => {
            debug!("Found {} at {:?}", binary, path);
            path.display().to_string()
        }
        Err(_) => {
            warn!("{} not found in PATH, spawning by name", binary);
            binary.to_string()
        }
    }
}

/// Keep printable ASCII only and drop `>`; an empty result means "use the server's cwd"
pub fn sanitize_cwd(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| (' '..='~').contains(c) && *c != '>')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Return `config_path` if it declares MCP servers globally or for `project_dir`
pub fn detect_mcp_config(config_path: &Path, project_dir: &Path) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(config_path).ok()?;
    let config: Value = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring unreadable MCP config {:?}: {}", config_path, e);
            return None;
        }
    };

    let has_servers = |value: Option<&Value>| {
        value
            .and_then(Value::as_object)
            .is_some_and(|servers| !servers.is_empty())
    };

    let global = has_servers(config.get("mcpServers"));
    let project = has_servers(
        config
            .get("geminiProjects")
            .and_then(|projects| projects.get(project_dir.to_string_lossy().as_ref()))
            .and_then(|project| project.get("mcpServers")),
    );

    if global || project {
        info!("Using MCP config {:?}", config_path);
        Some(config_path.to_path_buf())
    } else {
        None
    }
}

/// Default MCP config location (`~/.gemini.json`)
pub fn default_mcp_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gemini.json"))
}
