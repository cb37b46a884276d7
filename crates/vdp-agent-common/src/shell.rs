//! Command execution for the agent.
//!
//! Every external tool the agent drives (`ovs-vsctl`, `ovs-ofctl`, `ip`,
//! `lldptool`, the uplink detection script) is invoked through the
//! [`CommandExecutor`] trait. Commands are argument vectors, never shell
//! strings; [`ShellExecutor`] spawns them directly with an optional
//! privilege prefix such as `sudo`.
//!
//! # Example
//!
//! ```ignore
//! use vdp_agent_common::shell::{argv, CommandExecutor, ShellExecutor};
//!
//! let exec = ShellExecutor::new(Some("sudo"));
//! let flows = exec
//!     .execute(&argv(["ovs-ofctl", "dump-flows", "br-ethd"]), true)
//!     .await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{AgentError, AgentResult};

/// Arguments that can be shown unquoted in logs.
static PLAIN_ARG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_./:=,+@%-]+$").expect("Invalid regex pattern"));

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string the way a shell would need it inside double quotes.
///
/// ```
/// use vdp_agent_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Renders an argument vector as a single line for logs and errors.
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if PLAIN_ARG_RE.is_match(a) {
                a.clone()
            } else {
                shellquote(a)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an owned argument vector from string-like items.
pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Process-execution collaborator.
///
/// Implementations run `argv`, prefixed with the privilege helper when
/// `as_root` is set, and return stdout on a zero exit code. A non-zero exit
/// is reported as [`AgentError::CommandFailed`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs one command to completion.
    async fn execute(&self, argv: &[String], as_root: bool) -> AgentResult<String>;
}

/// Spawns a command and captures its output without interpreting the exit code.
pub async fn exec(argv: &[String]) -> AgentResult<ExecResult> {
    let rendered = render_command(argv);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::internal("empty command"))?;

    tracing::debug!(command = %rendered, "Executing command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AgentError::ShellExec {
            command: rendered.clone(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %rendered, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %rendered,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs a command and returns an error on non-zero exit.
pub async fn exec_or_throw(argv: &[String]) -> AgentResult<String> {
    let result = exec(argv).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(AgentError::CommandFailed {
            command: render_command(argv),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// [`CommandExecutor`] backed by real processes.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    root_helper: Vec<String>,
}

impl ShellExecutor {
    /// Creates an executor. `root_helper` is split on whitespace, so values
    /// like `"sudo neutron-rootwrap /etc/neutron/rootwrap.conf"` work.
    pub fn new(root_helper: Option<&str>) -> Self {
        Self {
            root_helper: root_helper
                .map(|h| h.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    /// Returns the full argument vector that would be spawned.
    pub fn full_argv(&self, argv: &[String], as_root: bool) -> Vec<String> {
        if as_root {
            self.root_helper.iter().chain(argv.iter()).cloned().collect()
        } else {
            argv.to_vec()
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, argv: &[String], as_root: bool) -> AgentResult<String> {
        exec_or_throw(&self.full_argv(argv, as_root)).await
    }
}
