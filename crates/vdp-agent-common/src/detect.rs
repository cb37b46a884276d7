//! Uplink detection collaborator.

use async_trait::async_trait;

use crate::error::AgentResult;

/// One detection observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectResult {
    /// A specific uplink interface was found
    Interface(String),
    /// The known uplink is still fine
    Normal,
    /// The known uplink lost its peer
    Down,
    /// No uplink found yet
    Undetected,
}

impl DetectResult {
    /// Maps the detection script's output.
    ///
    /// ```
    /// use vdp_agent_common::DetectResult;
    ///
    /// assert_eq!(DetectResult::from_output("eth2\n"), DetectResult::Interface("eth2".into()));
    /// assert_eq!(DetectResult::from_output(""), DetectResult::Undetected);
    /// ```
    pub fn from_output(output: &str) -> Self {
        match output.trim() {
            "" | "none" | "undetected" => DetectResult::Undetected,
            "normal" => DetectResult::Normal,
            "down" => DetectResult::Down,
            name => DetectResult::Interface(name.to_string()),
        }
    }
}

/// Finds the physical uplink facing the VDP switch.
#[async_trait]
pub trait UplinkDetector: Send + Sync {
    /// `veth` is the protocol veth of the bound uplink, if any.
    async fn detect(&self, veth: Option<&str>) -> AgentResult<DetectResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_output() {
        assert_eq!(DetectResult::from_output("normal"), DetectResult::Normal);
        assert_eq!(DetectResult::from_output(" down "), DetectResult::Down);
        assert_eq!(DetectResult::from_output("none"), DetectResult::Undetected);
        assert_eq!(
            DetectResult::from_output("enp3s0"),
            DetectResult::Interface("enp3s0".into())
        );
    }
}
