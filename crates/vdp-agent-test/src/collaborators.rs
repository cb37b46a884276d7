//! Recording and scripted collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use vdp_agent_common::{
    AgentResult, DetectResult, Orchestrator, RpcError, UplinkDetector, UplinkReport,
    VmResultReport,
};

/// Orchestrator that keeps every report it receives.
///
/// With [`set_failing`](Self::set_failing) each call still records, then
/// answers with a timeout.
#[derive(Debug, Default)]
pub struct RecordingOrchestrator {
    vm_reports: Mutex<Vec<VmResultReport>>,
    uplink_reports: Mutex<Vec<UplinkReport>>,
    failing: AtomicBool,
}

impl RecordingOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn vm_reports(&self) -> Vec<VmResultReport> {
        self.vm_reports.lock().clone()
    }

    pub fn uplink_reports(&self) -> Vec<UplinkReport> {
        self.uplink_reports.lock().clone()
    }

    /// Latest report for one port.
    pub fn last_report_for(&self, port_id: &str) -> Option<VmResultReport> {
        self.vm_reports
            .lock()
            .iter()
            .rev()
            .find(|r| r.port_id == port_id)
            .cloned()
    }

    fn outcome(&self, method: &str) -> Result<(), RpcError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RpcError::Timeout {
                method: method.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
    async fn report_vm_result(&self, report: VmResultReport) -> Result<(), RpcError> {
        self.vm_reports.lock().push(report);
        self.outcome("report_vm_result")
    }

    async fn persist_uplink(&self, report: UplinkReport) -> Result<(), RpcError> {
        self.uplink_reports.lock().push(report);
        self.outcome("persist_uplink")
    }
}

/// Detector replaying queued results, then a fixed default.
#[derive(Debug)]
pub struct ScriptedDetector {
    default: DetectResult,
    queued: Mutex<VecDeque<DetectResult>>,
    seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedDetector {
    pub fn new(default: DetectResult) -> Self {
        Self {
            default,
            queued: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queues the answer for a future call.
    pub fn push(&self, result: DetectResult) {
        self.queued.lock().push_back(result);
    }

    /// Veth argument of every call so far.
    pub fn seen_veths(&self) -> Vec<Option<String>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl UplinkDetector for ScriptedDetector {
    async fn detect(&self, veth: Option<&str>) -> AgentResult<DetectResult> {
        self.seen.lock().push(veth.map(str::to_string));
        let next = self.queued.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.default.clone()))
    }
}
