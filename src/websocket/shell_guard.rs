use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::guards::{resolve_against, PathGuard};

/// Whitespace-separated words, keeping simple quoted runs together
static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:[^\s"']+|"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')+"#).expect("valid regex")
});

const CTRL_C: char = '\u{3}';
const BACKSPACE: char = '\u{8}';
const DELETE: char = '\u{7f}';
/// Clears the current input line in bash
pub const CLEAR_LINE: &str = "\u{15}";

/// What to do with a chunk of terminal input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellAction {
    /// Forward to the PTY
    Write(String),
    /// Show `message` to the client and clear the PTY's input line
    Reject(String),
}

/// Decision for one complete command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed { next_cwd: Option<PathBuf> },
    Blocked(String),
}

/// Line-buffered validator that keeps interactive shell commands inside the
/// configured root. Keystrokes pass through as typed; a command is checked
/// when Enter arrives.
#[derive(Debug)]
pub struct ShellGuard {
    paths: PathGuard,
    cwd: PathBuf,
    buffer: String,
}

impl ShellGuard {
    pub fn new(paths: PathGuard, cwd: impl Into<PathBuf>) -> Self {
        Self {
            paths,
            cwd: cwd.into(),
            buffer: String::new(),
        }
    }

    /// Directory the shell is believed to be in
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn feed(&mut self, data: &str) -> Vec<ShellAction> {
        if self.paths.root().is_none() {
            return vec![ShellAction::Write(data.to_string())];
        }

        let mut actions = Vec::new();
        let mut pending = String::new();
        for ch in data.chars() {
            match ch {
                CTRL_C => {
                    self.buffer.clear();
                    pending.push(ch);
                }
                BACKSPACE | DELETE => {
                    self.buffer.pop();
                    pending.push(ch);
                }
                '\r' | '\n' => match self.validate(&self.buffer) {
                    Verdict::Blocked(message) => {
                        if !pending.is_empty() {
                            actions.push(ShellAction::Write(std::mem::take(&mut pending)));
                        }
                        actions.push(ShellAction::Reject(message));
                        self.buffer.clear();
                    }
                    Verdict::Allowed { next_cwd } => {
                        if let Some(next) = next_cwd {
                            self.cwd = next;
                        }
                        self.buffer.clear();
                        pending.push(ch);
                    }
                },
                _ => {
                    self.buffer.push(ch);
                    pending.push(ch);
                }
            }
        }
        if !pending.is_empty() {
            actions.push(ShellAction::Write(pending));
        }
        actions
    }

    /// Check one command line against the root
    pub fn validate(&self, command: &str) -> Verdict {
        let Some(root) = self.paths.root() else {
            return Verdict::Allowed { next_cwd: None };
        };
        let tokens: Vec<&str> = TOKEN.find_iter(command.trim()).map(|m| m.as_str()).collect();
        let Some(first) = tokens.first() else {
            return Verdict::Allowed { next_cwd: None };
        };

        if *first == "cd" {
            let target = tokens.get(1).copied().map(strip_quotes);
            let resolved = match target {
                Some("-") => {
                    return Verdict::Blocked(format!(
                        "cd - is not allowed under SHELL_ROOT ({})",
                        root.display()
                    ))
                }
                Some(target) => resolve_against(&self.cwd, Path::new(target)),
                None => root.to_path_buf(),
            };
            if !self.paths.is_within_root(&resolved) {
                return Verdict::Blocked(format!(
                    "Path not allowed. Stay within SHELL_ROOT ({})",
                    root.display()
                ));
            }
            return Verdict::Allowed {
                next_cwd: Some(resolved),
            };
        }

        for token in &tokens {
            if token.starts_with('-') {
                continue;
            }
            let clean = strip_quotes(token);
            let suspicious =
                Path::new(clean).is_absolute() || clean.contains("..") || clean.contains('/');
            if suspicious && !self.paths.is_within_root(resolve_against(&self.cwd, Path::new(clean)))
            {
                return Verdict::Blocked(format!(
                    "Access outside SHELL_ROOT is blocked ({})",
                    root.display()
                ));
            }
        }
        Verdict::Allowed { next_cwd: None }
    }
}

fn strip_quotes(token: &str) -> &str {
    let token = token.strip_prefix(['"', '\'']).unwrap_or(token);
    token.strip_suffix(['"', '\'']).unwrap_or(token)
}
