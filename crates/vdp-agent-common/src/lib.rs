//! Common infrastructure for the VDP uplink agent.
//!
//! - [`shell`]: Command execution with an optional privilege prefix
//! - [`error`]: Error types shared by every agent crate
//! - [`orchestrator`]: Control-plane reporting interface
//! - [`detect`]: Uplink detection interface
//!
//! # Example
//!
//! ```ignore
//! use vdp_agent_common::shell::{CommandExecutor, ShellExecutor};
//!
//! let exec = ShellExecutor::new(Some("sudo"));
//! let out = exec.execute(&argv(["ovs-vsctl", "list-br"]), true).await?;
//! ```

pub mod detect;
pub mod error;
pub mod orchestrator;
pub mod shell;

pub use detect::{DetectResult, UplinkDetector};
pub use error::{AgentError, AgentResult};
pub use orchestrator::{Orchestrator, RpcError, UplinkReport, VmResult, VmResultReport};
pub use shell::{argv, CommandExecutor, ShellExecutor};
