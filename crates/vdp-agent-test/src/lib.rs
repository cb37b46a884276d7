//! Test infrastructure for the VDP uplink agent
//!
//! Provides:
//! - [`FakeHost`]: an in-memory host answering `ovs-vsctl`, `ovs-ofctl`,
//!   `ip` and `lldptool` the way the real tools do
//! - [`ScriptedExecutor`]: canned command answers for parser tests
//! - Recording and scripted orchestrator/detector collaborators
//! - Fixtures and verification helpers for scenario tests

mod collaborators;
pub mod fixtures;
mod host;
mod verification;

pub use collaborators::{RecordingOrchestrator, ScriptedDetector};
pub use fixtures::{BR_EX, BR_INT, UPLINK};
pub use host::{FakeHost, ReplyFormat, ScriptedExecutor};
pub use verification::*;
