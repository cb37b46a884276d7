//! Control-plane collaborator.
//!
//! The agent reports every VM request outcome and the discovered uplink to
//! an orchestrator. Both calls may time out; callers log and continue.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Outcome of a VM request as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmResult {
    Success,
    CreateFailed,
    DeleteFailed,
}

impl VmResult {
    /// Wire string understood by the orchestrator
    pub fn as_str(&self) -> &'static str {
        match self {
            VmResult::Success => "SUCCESS",
            VmResult::CreateFailed => "CREATE:FAIL",
            VmResult::DeleteFailed => "DELETE:FAIL",
        }
    }
}

impl fmt::Display for VmResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-port result pushed upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmResultReport {
    pub port_id: String,
    pub result: VmResult,
    pub local_vlan: Option<u16>,
    pub provider_vlan: Option<u16>,
    pub fail_reason: Option<String>,
}

impl VmResultReport {
    /// A successful report.
    pub fn success(port_id: impl Into<String>, local_vlan: Option<u16>, provider_vlan: Option<u16>) -> Self {
        Self {
            port_id: port_id.into(),
            result: VmResult::Success,
            local_vlan,
            provider_vlan,
            fail_reason: None,
        }
    }

    /// A failure report without VLAN information.
    pub fn failure(port_id: impl Into<String>, result: VmResult, reason: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            result,
            local_vlan: None,
            provider_vlan: None,
            fail_reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == VmResult::Success
    }
}

/// Uplink state persisted upstream. Empty names mean "no uplink".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkReport {
    pub uplink: String,
    pub veth: String,
    pub fail_reason: Option<String>,
}

impl UplinkReport {
    pub fn up(uplink: impl Into<String>, veth: impl Into<String>) -> Self {
        Self {
            uplink: uplink.into(),
            veth: veth.into(),
            fail_reason: None,
        }
    }

    pub fn down() -> Self {
        Self::default()
    }

    pub fn undiscovered(reason: impl Into<String>) -> Self {
        Self {
            fail_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Errors from the orchestrator channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No answer within the messaging timeout
    #[error("RPC '{method}' timed out")]
    Timeout { method: String },

    /// The remote side refused the call
    #[error("RPC '{method}' failed: {message}")]
    Failed { method: String, message: String },
}

/// Control-plane RPC channel.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Reports the outcome of one VM port request.
    async fn report_vm_result(&self, report: VmResultReport) -> Result<(), RpcError>;

    /// Persists the discovered uplink and protocol veth.
    async fn persist_uplink(&self, report: UplinkReport) -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_result_strings() {
        assert_eq!(VmResult::Success.to_string(), "SUCCESS");
        assert_eq!(VmResult::CreateFailed.as_str(), "CREATE:FAIL");
        assert_eq!(VmResult::DeleteFailed.as_str(), "DELETE:FAIL");
    }

    #[test]
    fn test_reports() {
        let ok = VmResultReport::success("p1", Some(10), Some(3003));
        assert!(ok.is_success());
        assert_eq!(ok.fail_reason, None);

        let fail = VmResultReport::failure("p1", VmResult::CreateFailed, "no vlan");
        assert!(!fail.is_success());
        assert_eq!(fail.provider_vlan, None);

        assert_eq!(UplinkReport::down(), UplinkReport::default());
        assert_eq!(UplinkReport::up("eth2", "vdpo-eth2").veth, "vdpo-eth2");
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::Timeout {
            method: "persist_uplink".into(),
        };
        assert_eq!(err.to_string(), "RPC 'persist_uplink' timed out");
    }
}
