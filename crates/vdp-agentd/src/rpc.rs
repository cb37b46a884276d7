//! Orchestrator reporting
//!
//! Reports are fire-and-forget: a timeout or refusal is logged and the
//! orchestrator is left to reconcile on its own.

use async_trait::async_trait;
use tracing::{info, warn};

use vdp_agent_common::{Orchestrator, RpcError, UplinkReport, VmResultReport};

/// Reports a VM result, logging any RPC error.
pub async fn report_vm_result(orchestrator: &dyn Orchestrator, report: VmResultReport) {
    let port_id = report.port_id.clone();
    let result = report.result;
    if let Err(e) = orchestrator.report_vm_result(report).await {
        warn!(port_id = %port_id, result = %result, error = %e, "Failed to report VM result");
    }
}

/// Persists the uplink state, logging any RPC error.
pub async fn persist_uplink(orchestrator: &dyn Orchestrator, report: UplinkReport) {
    let uplink = report.uplink.clone();
    if let Err(e) = orchestrator.persist_uplink(report).await {
        warn!(uplink = %uplink, error = %e, "Failed to persist uplink");
    }
}

/// Orchestrator that only logs, for running without a control plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOrchestrator;

#[async_trait]
impl Orchestrator for LoggingOrchestrator {
    async fn report_vm_result(&self, report: VmResultReport) -> Result<(), RpcError> {
        info!(
            port_id = %report.port_id,
            result = %report.result,
            local_vlan = ?report.local_vlan,
            provider_vlan = ?report.provider_vlan,
            fail_reason = ?report.fail_reason,
            "VM result"
        );
        Ok(())
    }

    async fn persist_uplink(&self, report: UplinkReport) -> Result<(), RpcError> {
        info!(
            uplink = %report.uplink,
            veth = %report.veth,
            fail_reason = ?report.fail_reason,
            "Uplink state"
        );
        Ok(())
    }
}
