//! Uplink detection through an external script

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use vdp_agent_common::{AgentResult, CommandExecutor, DetectResult, UplinkDetector};

/// Runs the configured detection command.
///
/// The command is split on whitespace; the protocol veth of the bound
/// uplink is appended when known. Output is mapped with
/// [`DetectResult::from_output`].
pub struct ScriptUplinkDetector {
    exec: Arc<dyn CommandExecutor>,
    command: Vec<String>,
}

impl ScriptUplinkDetector {
    pub fn new(exec: Arc<dyn CommandExecutor>, command: &str) -> Self {
        Self {
            exec,
            command: command.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Argument vector for one detection run.
    pub fn argv(&self, veth: Option<&str>) -> Vec<String> {
        let mut argv = self.command.clone();
        if let Some(veth) = veth {
            argv.push(veth.to_string());
        }
        argv
    }
}

#[async_trait]
impl UplinkDetector for ScriptUplinkDetector {
    async fn detect(&self, veth: Option<&str>) -> AgentResult<DetectResult> {
        let out = self.exec.execute(&self.argv(veth), true).await?;
        let result = DetectResult::from_output(&out);
        debug!(veth = ?veth, result = ?result, "Uplink detection");
        Ok(result)
    }
}
