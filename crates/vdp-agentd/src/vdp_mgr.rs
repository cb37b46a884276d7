//! Uplink manager
//!
//! Owns the event queues, the uplink discovery state machine and the map of
//! live uplink bridges. All bridge creation, teardown and VM port work runs
//! on a single consumer; detection and error-queue draining run as periodic
//! tasks that only enqueue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vdp_agent_common::{
    AgentError, AgentResult, CommandExecutor, DetectResult, Orchestrator, UplinkDetector, UplinkReport,
    VmResultReport,
};
use vdp_orch_common::{supervise, PeriodicTask, PriorityQueue, TaskError, TaskResult, TaskResultExt};

use crate::config::AgentConfig;
use crate::ovs_lib::OvsCtl;
use crate::ovs_vdp::{cleanup_stale, OvsVdp, RestartEntry};
use crate::rpc;
use crate::types::*;

/// Uplink discovery state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkState {
    /// Required bridges missing or uplink released
    NoUplink,
    /// Waiting for discovery or for the bridge to come up
    Detecting,
    /// Bridge for this uplink is ready
    Up(String),
    /// Uplink-down queued
    GoingDown,
}

#[derive(Debug)]
struct DetectState {
    restart_ready: bool,
    uplink: Option<String>,
    veth: Option<String>,
    state: UplinkState,
    down_count: u32,
    up_in_progress: bool,
    static_down_sent: bool,
}

impl Default for DetectState {
    fn default() -> Self {
        Self {
            restart_ready: false,
            uplink: None,
            veth: None,
            state: UplinkState::NoUplink,
            down_count: 0,
            up_in_progress: false,
            static_down_sent: false,
        }
    }
}

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Top-level VDP agent
pub struct VdpMgr {
    config: AgentConfig,
    exec: Arc<dyn CommandExecutor>,
    ovs: OvsCtl,
    detector: Arc<dyn UplinkDetector>,
    orchestrator: Arc<dyn Orchestrator>,
    queue: PriorityQueue<VdpQueMsg>,
    error_queue: PriorityQueue<VdpQueMsg>,
    bridges: parking_lot::Mutex<HashMap<String, Arc<OvsVdp>>>,
    detect: parking_lot::Mutex<DetectState>,
    restart_cache: parking_lot::Mutex<Vec<RestartEntry>>,
    tasks: parking_lot::Mutex<Vec<PeriodicTask>>,
    consumer: parking_lot::Mutex<Option<Consumer>>,
}

impl VdpMgr {
    /// Creates a manager; the configuration is validated first.
    pub fn new(
        config: AgentConfig,
        exec: Arc<dyn CommandExecutor>,
        detector: Arc<dyn UplinkDetector>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> AgentResult<Arc<Self>> {
        config.validate()?;
        let ovs = OvsCtl::new(exec.clone(), &config.agent);
        Ok(Arc::new(Self {
            config,
            exec,
            ovs,
            detector,
            orchestrator,
            queue: PriorityQueue::new("vdp"),
            error_queue: PriorityQueue::new("vdp-error"),
            bridges: parking_lot::Mutex::new(HashMap::new()),
            detect: parking_lot::Mutex::new(DetectState::default()),
            restart_cache: parking_lot::Mutex::new(Vec::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
            consumer: parking_lot::Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn uplink_state(&self) -> UplinkState {
        self.detect.lock().state.clone()
    }

    /// Uplink currently bound by discovery or restart state.
    pub fn bound_uplink(&self) -> Option<String> {
        self.detect.lock().uplink.clone()
    }

    /// Protocol veth of the bound uplink.
    pub fn bound_veth(&self) -> Option<String> {
        self.detect.lock().veth.clone()
    }

    pub fn bridge(&self, uplink: &str) -> Option<Arc<OvsVdp>> {
        self.bridges.lock().get(uplink).cloned()
    }

    fn has_bridge(&self, uplink: &str) -> bool {
        self.bridges.lock().contains_key(uplink)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_errors(&self) -> usize {
        self.error_queue.len()
    }

    // ---- intake ----

    /// Queues a VM port plug/unplug, tagged with the bound uplink.
    pub fn notify_vm_port_event(
        &self,
        status: PortStatus,
        port_id: &str,
        mac: &str,
        net_id: &str,
        segmentation_id: u32,
        oui: Option<OuiData>,
    ) -> AgentResult<()> {
        let ev = VmEvent::new(
            port_id,
            mac,
            net_id,
            segmentation_id,
            status,
            oui,
            self.bound_uplink(),
        )?;
        debug!(port_id = %port_id, status = status.as_str(), uplink = ?ev.phy_uplink, "Queued VM event");
        let msg = VdpQueMsg::Vm(ev);
        self.queue.push(msg.priority(), msg);
        Ok(())
    }

    /// Queues an uplink up/down.
    pub fn enqueue_uplink_event(&self, status: UplinkStatus, uplink: &str) -> AgentResult<()> {
        let ev = UplinkEvent::new(
            status,
            uplink,
            self.config.bridges.integration_bridge.clone(),
            self.config.bridges.external_bridge.clone(),
        )?;
        info!(uplink = %uplink, status = status.as_str(), "Queued uplink event");
        let msg = VdpQueMsg::Uplink(ev);
        self.queue.push(msg.priority(), msg);
        Ok(())
    }

    /// Restores the persisted uplink and veth. Detection does nothing until
    /// this has been called.
    pub fn notify_uplink_restart_state(&self, uplink: Option<String>, veth: Option<String>) {
        let mut d = self.detect.lock();
        info!(uplink = ?uplink, veth = ?veth, "Uplink restart state");
        d.restart_ready = true;
        d.uplink = uplink.filter(|u| !u.is_empty());
        d.veth = veth.filter(|v| !v.is_empty());
    }

    /// Rehydrates one port without negotiating. Applied to the bound uplink's
    /// bridge, or staged until the next bridge comes up.
    pub async fn populate_cache_after_restart(
        &self,
        port_id: &str,
        mac: &str,
        net_id: &str,
        local_vlan: u16,
        provider_vlan: Option<u16>,
        segmentation_id: u32,
    ) -> AgentResult<()> {
        let entry = RestartEntry {
            port_id: port_id.to_string(),
            mac: normalize_mac(mac)?,
            net_id: net_id.to_string(),
            local_vlan,
            provider_vlan: provider_vlan.filter(|v| is_valid_vlan(*v)),
            segmentation_id,
        };
        let bridge = self.bound_uplink().and_then(|u| self.bridge(&u));
        match bridge {
            Some(bridge) => bridge.populate_cache(&entry).await,
            None => {
                debug!(port_id = %port_id, "Staging restart entry until the uplink is up");
                self.restart_cache.lock().push(entry);
            }
        }
        Ok(())
    }

    // ---- detection ----

    /// One detection tick.
    #[instrument(skip(self))]
    pub async fn run_detection_once(&self) -> AgentResult<()> {
        if !self.detect.lock().restart_ready {
            debug!("Restart state not yet known, skipping detection");
            return Ok(());
        }

        for br in [
            &self.config.bridges.integration_bridge,
            &self.config.bridges.external_bridge,
        ] {
            if !self.ovs.bridge_exists(br).await? {
                debug!(bridge = %br, "Bridge missing, no uplink possible");
                self.detect.lock().state = UplinkState::NoUplink;
                return Ok(());
            }
        }

        if self.config.uplink.static_uplink {
            self.detect_static().await
        } else {
            self.detect_dynamic().await
        }
    }

    async fn detect_static(&self) -> AgentResult<()> {
        let port = self
            .config
            .uplink
            .static_uplink_port
            .clone()
            .unwrap_or_default();

        let (bound, veth) = {
            let d = self.detect.lock();
            (d.uplink.clone(), d.veth.clone())
        };
        if bound.is_none() {
            {
                let mut d = self.detect.lock();
                d.uplink = Some(port.clone());
                d.up_in_progress = true;
                d.state = UplinkState::Detecting;
            }
            info!(uplink = %port, "Binding static uplink");
            return self.enqueue_uplink_event(UplinkStatus::Up, &port);
        }

        let result = self.detector.detect(veth.as_deref()).await?;
        match result {
            DetectResult::Down => {
                let send = {
                    let mut d = self.detect.lock();
                    let send = !d.static_down_sent;
                    if send {
                        d.static_down_sent = true;
                        d.state = UplinkState::GoingDown;
                    }
                    send
                };
                if send {
                    warn!(uplink = %port, "Static uplink down");
                    self.enqueue_uplink_event(UplinkStatus::Down, &port)?;
                }
            }
            DetectResult::Normal | DetectResult::Interface(_) => {
                self.detect.lock().static_down_sent = false;
                self.ensure_uplink_up(&port)?;
            }
            DetectResult::Undetected => debug!(uplink = %port, "Static uplink peer not detected"),
        }
        Ok(())
    }

    async fn detect_dynamic(&self) -> AgentResult<()> {
        let veth = self.bound_veth();
        let result = self.detector.detect(veth.as_deref()).await?;

        if result == DetectResult::Down {
            let down = {
                let mut d = self.detect.lock();
                d.down_count += 1;
                debug!(count = d.down_count, threshold = self.config.uplink.down_threshold, "Uplink down observed");
                if d.down_count == self.config.uplink.down_threshold {
                    d.veth = None;
                    let uplink = d.uplink.take();
                    if uplink.is_some() {
                        d.state = UplinkState::GoingDown;
                    }
                    uplink
                } else {
                    None
                }
            };
            if let Some(uplink) = down {
                warn!(uplink = %uplink, "Uplink down threshold reached");
                self.enqueue_uplink_event(UplinkStatus::Down, &uplink)?;
            }
            return Ok(());
        }
        self.detect.lock().down_count = 0;

        match result {
            DetectResult::Undetected => {
                let persist = {
                    let mut d = self.detect.lock();
                    if d.veth.is_some() {
                        warn!(veth = ?d.veth, uplink = ?d.uplink, "Uplink undetected while a protocol veth is known, rediscovering");
                        d.veth = None;
                        false
                    } else {
                        d.state = UplinkState::Detecting;
                        !d.up_in_progress
                    }
                };
                if persist {
                    rpc::persist_uplink(
                        self.orchestrator.as_ref(),
                        UplinkReport::undiscovered(UPLINK_UNDISCOVERED_REASON),
                    )
                    .await;
                }
            }
            DetectResult::Normal => match self.bound_uplink() {
                Some(uplink) => self.ensure_uplink_up(&uplink)?,
                None => debug!("Detection normal without a bound uplink"),
            },
            DetectResult::Interface(name) => {
                let previous = self.bound_uplink();
                if previous.as_deref() == Some(name.as_str()) {
                    self.ensure_uplink_up(&name)?;
                } else {
                    if let Some(old) = previous {
                        info!(old = %old, new = %name, "Uplink changed");
                        self.enqueue_uplink_event(UplinkStatus::Down, &old)?;
                    }
                    {
                        let mut d = self.detect.lock();
                        d.uplink = Some(name.clone());
                        d.veth = None;
                        d.up_in_progress = true;
                        d.state = UplinkState::Detecting;
                    }
                    info!(uplink = %name, "Uplink discovered");
                    self.enqueue_uplink_event(UplinkStatus::Up, &name)?;
                }
            }
            DetectResult::Down => {}
        }
        Ok(())
    }

    /// Queues uplink-up when no bridge exists and none is being built.
    fn ensure_uplink_up(&self, uplink: &str) -> AgentResult<()> {
        if self.has_bridge(uplink) {
            return Ok(());
        }
        {
            let mut d = self.detect.lock();
            if d.up_in_progress {
                return Ok(());
            }
            d.up_in_progress = true;
        }
        info!(uplink = %uplink, "No bridge for uplink, queueing uplink-up");
        self.enqueue_uplink_event(UplinkStatus::Up, uplink)
    }

    // ---- processing ----

    /// Processes one queued message; returns false if the queue was empty.
    pub async fn process_next(&self) -> bool {
        match self.queue.try_pop() {
            Some(msg) => {
                self.process_msg(msg).await;
                true
            }
            None => false,
        }
    }

    /// Processes until the queue is empty.
    pub async fn process_pending(&self) -> usize {
        let mut n = 0;
        while self.process_next().await {
            n += 1;
        }
        n
    }

    async fn process_msg(&self, msg: VdpQueMsg) {
        let desc = msg.describe();
        match supervise(&desc, self.dispatch(msg.clone())).await {
            Some(result) => match result.to_status() {
                status if status.is_success() => debug!(msg = %desc, outcome = ?result, "Processed"),
                status if status.is_retryable() => {
                    warn!(msg = %desc, error = ?result.err(), "Parking message on error queue");
                    self.error_queue.push(msg.priority(), msg);
                }
                status => error!(
                    msg = %desc,
                    status = ?status,
                    error = ?result.err(),
                    "Message processing failed"
                ),
            },
            None => match msg {
                VdpQueMsg::Vm(ev) => {
                    let report = VmResultReport::failure(
                        &ev.port_id,
                        failure_result(ev.status),
                        "internal error while processing request",
                    );
                    rpc::report_vm_result(self.orchestrator.as_ref(), report).await;
                }
                VdpQueMsg::Uplink(_) => self.error_queue.push(msg.priority(), msg),
            },
        }
    }

    async fn dispatch(&self, msg: VdpQueMsg) -> TaskResult<()> {
        match msg {
            VdpQueMsg::Uplink(ev) => match ev.status {
                UplinkStatus::Up => self.handle_uplink_up(&ev).await,
                UplinkStatus::Down => {
                    self.handle_uplink_down(&ev).await;
                    Ok(())
                }
            },
            VdpQueMsg::Vm(ev) => self.handle_vm_event(&ev).await,
        }
    }

    #[instrument(skip(self, ev), fields(uplink = %ev.phy_uplink))]
    async fn handle_uplink_up(&self, ev: &UplinkEvent) -> TaskResult<()> {
        // an uplink-up retried after its uplink went away or moved
        let bound = self.bound_uplink();
        if bound.as_deref() != Some(ev.phy_uplink.as_str()) {
            info!(bound = ?bound, "Uplink no longer bound, dropping uplink-up");
            return Err(TaskError::ignored(format!("uplink {} is not bound", ev.phy_uplink)));
        }

        if let Some(bridge) = self.bridge(&ev.phy_uplink) {
            self.uplink_ready(&bridge).await;
            return Err(TaskError::ignored("bridge already up"));
        }

        let setup = OvsVdp::setup(self.exec.clone(), &self.config, ev, self.orchestrator.clone()).await;
        let bridge = match setup {
            Ok(bridge) => bridge,
            Err(e) if e.is_retryable() => return Err(TaskError::need_retry(e.to_string())),
            Err(e) => {
                self.detect.lock().up_in_progress = false;
                return Err(TaskError::failed(e.to_string()));
            }
        };
        self.bridges
            .lock()
            .insert(ev.phy_uplink.clone(), bridge.clone());

        let staged: Vec<RestartEntry> = std::mem::take(&mut *self.restart_cache.lock());
        for entry in &staged {
            bridge.populate_cache(entry).await;
        }
        self.uplink_ready(&bridge).await;
        info!(restored = staged.len(), "Uplink up");
        Ok(())
    }

    async fn uplink_ready(&self, bridge: &OvsVdp) {
        let veth = bridge.veth().local_side.clone();
        {
            let mut d = self.detect.lock();
            d.up_in_progress = false;
            d.veth = Some(veth.clone());
            d.state = UplinkState::Up(bridge.uplink().to_string());
        }
        rpc::persist_uplink(self.orchestrator.as_ref(), UplinkReport::up(bridge.uplink(), veth)).await;
    }

    #[instrument(skip(self, ev), fields(uplink = %ev.phy_uplink))]
    async fn handle_uplink_down(&self, ev: &UplinkEvent) {
        let dropped = self.error_queue.retain(|m| {
            !matches!(m, VdpQueMsg::Uplink(up) if up.status == UplinkStatus::Up && up.phy_uplink == ev.phy_uplink)
        });
        if dropped > 0 {
            info!(count = dropped, "Dropped parked uplink-up");
        }

        let bridge = self.bridges.lock().remove(&ev.phy_uplink);
        match bridge {
            Some(bridge) => bridge.shutdown().await,
            None => {
                debug!("No bridge, cleaning up directly");
                let ovs = OvsCtl::new(self.exec.clone(), &self.config.agent);
                cleanup_stale(&ovs, &ev.br_ex, &ev.phy_uplink).await;
            }
        }
        {
            // a replacement uplink may already be bound with its uplink-up queued
            let mut d = self.detect.lock();
            if d.uplink.as_deref().map_or(true, |u| u == ev.phy_uplink) {
                d.state = UplinkState::NoUplink;
                d.up_in_progress = false;
            }
        }
        rpc::persist_uplink(self.orchestrator.as_ref(), UplinkReport::down()).await;
        info!("Uplink down");
    }

    async fn handle_vm_event(&self, ev: &VmEvent) -> TaskResult<()> {
        let bridge = ev.phy_uplink.as_deref().and_then(|u| self.bridge(u));
        match bridge {
            Some(bridge) => {
                let report = bridge.send_port_event(ev).await;
                rpc::report_vm_result(self.orchestrator.as_ref(), report).await;
                Ok(())
            }
            None => {
                let reason = match &ev.phy_uplink {
                    Some(uplink) => format!("uplink {} not ready", uplink),
                    None => UPLINK_UNDISCOVERED_REASON.to_string(),
                };
                let report = VmResultReport::failure(&ev.port_id, failure_result(ev.status), reason.clone());
                rpc::report_vm_result(self.orchestrator.as_ref(), report).await;
                Err(TaskError::failed(AgentError::uplink_not_ready(reason).to_string()))
            }
        }
    }

    /// Moves every parked uplink message back onto the main queue.
    pub fn drain_error_queue(&self) -> usize {
        let parked = self.error_queue.drain();
        let n = parked.len();
        for msg in parked {
            self.queue.push(msg.priority(), msg);
        }
        if n > 0 {
            info!(count = n, "Requeued parked uplink messages");
        }
        n
    }

    // ---- lifecycle ----

    /// Spawns the consumer loop and the periodic tasks.
    pub fn start(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mgr = self.clone();
        let handle = tokio::spawn(async move {
            info!("VDP queue consumer started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = mgr.queue.pop() => mgr.process_msg(msg).await,
                }
            }
            info!("VDP queue consumer stopped");
        });
        *self.consumer.lock() = Some(Consumer { cancel, handle });

        let weak: Weak<Self> = Arc::downgrade(self);
        let detect = PeriodicTask::spawn("uplink-detect", self.config.detect_interval(), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(mgr) => mgr.run_detection_once().await,
                    None => Ok(()),
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let drain = PeriodicTask::spawn("vdp-error-queue", self.config.error_queue_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(mgr) = weak.upgrade() {
                    mgr.drain_error_queue();
                }
                Ok::<_, String>(())
            }
        });

        self.tasks.lock().extend([detect, drain]);
    }

    /// Stops all tasks and tears down every bridge.
    pub async fn shutdown(&self) {
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.cancel.cancel();
            if let Err(e) = consumer.handle.await {
                warn!(error = %e, "Queue consumer ended abnormally");
            }
        }
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.join().await;
        }

        let bridges: Vec<Arc<OvsVdp>> = self.bridges.lock().drain().map(|(_, b)| b).collect();
        for bridge in bridges {
            bridge.shutdown().await;
        }
        info!("VDP manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vdp_agent_common::VmResult;
    use vdp_agent_test::fixtures::VmPortFixture;
    use vdp_agent_test::{FakeHost, RecordingOrchestrator, ScriptedDetector, BR_EX, UPLINK};

    /// Simulated host that panics once on a matching command.
    struct CrashingHost {
        host: Arc<FakeHost>,
        crash_on: parking_lot::Mutex<Option<String>>,
    }

    impl CrashingHost {
        fn arm(&self, pattern: &str) {
            *self.crash_on.lock() = Some(pattern.to_string());
        }
    }

    #[async_trait]
    impl CommandExecutor for CrashingHost {
        async fn execute(&self, argv: &[String], as_root: bool) -> AgentResult<String> {
            let rendered = argv.join(" ");
            let hit = {
                let mut crash_on = self.crash_on.lock();
                match crash_on.as_deref() {
                    Some(pattern) if rendered.contains(pattern) => crash_on.take(),
                    _ => None,
                }
            };
            if let Some(pattern) = hit {
                panic!("host crashed on {}", pattern);
            }
            self.host.execute(argv, as_root).await
        }
    }

    struct Harness {
        host: Arc<FakeHost>,
        detector: Arc<ScriptedDetector>,
        orch: Arc<RecordingOrchestrator>,
        mgr: Arc<VdpMgr>,
    }

    fn harness(config: AgentConfig) -> Harness {
        let host = Arc::new(FakeHost::standard());
        let detector = Arc::new(ScriptedDetector::new(DetectResult::Undetected));
        let orch = Arc::new(RecordingOrchestrator::new());
        let mgr = VdpMgr::new(config, host.clone(), detector.clone(), orch.clone()).unwrap();
        Harness {
            host,
            detector,
            orch,
            mgr,
        }
    }

    fn uplink_events(mgr: &VdpMgr) -> Vec<(UplinkStatus, String)> {
        std::iter::from_fn(|| mgr.queue.try_pop())
            .filter_map(|m| match m {
                VdpQueMsg::Uplink(ev) => Some((ev.status, ev.phy_uplink)),
                VdpQueMsg::Vm(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_detection_waits_for_restart_state() {
        let h = harness(AgentConfig::default());
        h.detector.push(DetectResult::Interface(UPLINK.into()));
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.pending(), 0);
        assert!(h.host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_missing_bridge_means_no_uplink() {
        let h = harness(AgentConfig::default());
        h.host.remove_bridge(BR_EX);
        h.mgr.notify_uplink_restart_state(None, None);
        h.detector.push(DetectResult::Interface(UPLINK.into()));
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.uplink_state(), UplinkState::NoUplink);
        assert_eq!(h.mgr.pending(), 0);
    }

    #[tokio::test]
    async fn test_down_debounce() {
        let h = harness(AgentConfig::default());
        h.mgr
            .notify_uplink_restart_state(Some(UPLINK.into()), Some("vdpl-eth2".into()));

        for _ in 0..2 {
            h.detector.push(DetectResult::Down);
            h.mgr.run_detection_once().await.unwrap();
        }
        // a non-down result resets the counter
        h.detector.push(DetectResult::Normal);
        h.mgr.run_detection_once().await.unwrap();
        let _ = uplink_events(&h.mgr);
        for _ in 0..2 {
            h.detector.push(DetectResult::Down);
            h.mgr.run_detection_once().await.unwrap();
        }
        assert!(uplink_events(&h.mgr).is_empty());

        for _ in 0..3 {
            h.detector.push(DetectResult::Down);
            h.mgr.run_detection_once().await.unwrap();
        }
        assert_eq!(
            uplink_events(&h.mgr),
            vec![(UplinkStatus::Down, UPLINK.to_string())]
        );
        assert_eq!(h.mgr.bound_uplink(), None);
        assert_eq!(h.mgr.bound_veth(), None);
    }

    #[tokio::test]
    async fn test_undetected_reports_once_known_veth_dropped() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(None, None);
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.uplink_state(), UplinkState::Detecting);
        assert_eq!(
            h.orch.uplink_reports(),
            vec![UplinkReport::undiscovered(UPLINK_UNDISCOVERED_REASON)]
        );

        let h = harness(AgentConfig::default());
        h.mgr
            .notify_uplink_restart_state(Some(UPLINK.into()), Some("vdpl-eth2".into()));
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.bound_veth(), None);
        assert_eq!(h.mgr.bound_uplink().as_deref(), Some(UPLINK));
        assert!(h.orch.uplink_reports().is_empty());
        assert_eq!(h.detector.seen_veths(), vec![Some("vdpl-eth2".to_string())]);
    }

    #[tokio::test]
    async fn test_normal_after_restart_requeues_up() {
        let h = harness(AgentConfig::default());
        h.mgr
            .notify_uplink_restart_state(Some(UPLINK.into()), Some("vdpl-eth2".into()));
        h.detector.push(DetectResult::Normal);
        h.detector.push(DetectResult::Normal);
        h.mgr.run_detection_once().await.unwrap();
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(
            uplink_events(&h.mgr),
            vec![(UplinkStatus::Up, UPLINK.to_string())]
        );
    }

    #[tokio::test]
    async fn test_new_interface_replaces_old() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some("eth1".into()), None);
        h.detector.push(DetectResult::Interface(UPLINK.into()));
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(
            uplink_events(&h.mgr),
            vec![
                (UplinkStatus::Down, "eth1".to_string()),
                (UplinkStatus::Up, UPLINK.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_static_uplink() {
        let mut config = AgentConfig::default();
        config.uplink.static_uplink = true;
        config.uplink.static_uplink_port = Some(UPLINK.to_string());
        let h = harness(config);
        h.mgr.notify_uplink_restart_state(None, None);

        h.mgr.run_detection_once().await.unwrap();
        assert!(h.detector.seen_veths().is_empty());
        assert_eq!(
            uplink_events(&h.mgr),
            vec![(UplinkStatus::Up, UPLINK.to_string())]
        );

        // one down is enough, and only sent once
        h.detector.push(DetectResult::Down);
        h.detector.push(DetectResult::Down);
        h.mgr.run_detection_once().await.unwrap();
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(
            uplink_events(&h.mgr),
            vec![(UplinkStatus::Down, UPLINK.to_string())]
        );
    }

    #[tokio::test]
    async fn test_vm_event_without_uplink_fails() {
        let h = harness(AgentConfig::default());
        h.mgr
            .notify_vm_port_event(PortStatus::Up, "p1", "fa:16:3e:00:00:01", "n1", 100, None)
            .unwrap();
        h.mgr.process_pending().await;

        let reports = h.orch.vm_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].result, VmResult::CreateFailed);
        assert_eq!(reports[0].fail_reason.as_deref(), Some(UPLINK_UNDISCOVERED_REASON));
    }

    #[tokio::test]
    async fn test_invalid_vm_event_rejected_synchronously() {
        let h = harness(AgentConfig::default());
        assert!(h
            .mgr
            .notify_vm_port_event(PortStatus::Up, "p1", "not-a-mac", "n1", 100, None)
            .is_err());
        assert_eq!(h.mgr.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_setup_parked_and_retried() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some(UPLINK.into()), None);
        h.host.fail_once("add-port", 1);
        h.mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();
        h.mgr.process_pending().await;
        assert!(h.mgr.bridge(UPLINK).is_none());
        assert_eq!(h.mgr.pending_errors(), 1);

        assert_eq!(h.mgr.drain_error_queue(), 1);
        h.mgr.process_pending().await;
        assert!(h.mgr.bridge(UPLINK).is_some());
        assert_eq!(h.mgr.uplink_state(), UplinkState::Up(UPLINK.to_string()));
        assert_eq!(
            h.orch.uplink_reports().last().cloned(),
            Some(UplinkReport::up(UPLINK, "vdpl-eth2"))
        );
    }

    #[tokio::test]
    async fn test_uplink_priority_over_vm() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some(UPLINK.into()), None);
        h.mgr
            .notify_vm_port_event(PortStatus::Down, "p1", "fa:16:3e:00:00:01", "n1", 100, None)
            .unwrap();
        h.mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();

        assert!(matches!(h.mgr.queue.try_pop(), Some(VdpQueMsg::Uplink(_))));
        assert!(matches!(h.mgr.queue.try_pop(), Some(VdpQueMsg::Vm(_))));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let mut config = AgentConfig::default();
        config.uplink.detect_interval_secs = 0;
        let host = Arc::new(FakeHost::standard());
        let detector = Arc::new(ScriptedDetector::new(DetectResult::Undetected));
        let result = VdpMgr::new(config, host, detector, Arc::new(RecordingOrchestrator::new()));
        assert!(matches!(result, Err(AgentError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_uplink_up_for_unbound_uplink_ignored() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some("eth3".into()), None);
        h.mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();
        h.mgr.process_pending().await;

        assert!(h.mgr.bridge(UPLINK).is_none());
        assert_eq!(h.mgr.pending_errors(), 0);
        assert!(h.host.commands_matching("add-port").is_empty());
        assert!(h.orch.uplink_reports().is_empty());
    }

    #[tokio::test]
    async fn test_uplink_down_drops_parked_up() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some(UPLINK.into()), None);
        h.host.fail_once("add-port", 1);
        h.mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();
        h.mgr.process_pending().await;
        assert_eq!(h.mgr.pending_errors(), 1);

        h.mgr.enqueue_uplink_event(UplinkStatus::Down, UPLINK).unwrap();
        h.mgr.process_pending().await;
        assert_eq!(h.mgr.pending_errors(), 0);
        assert_eq!(h.mgr.drain_error_queue(), 0);
        assert_eq!(h.mgr.uplink_state(), UplinkState::NoUplink);
    }

    #[tokio::test]
    async fn test_old_uplink_down_keeps_new_up_in_progress() {
        let h = harness(AgentConfig::default());
        h.mgr.notify_uplink_restart_state(Some("eth1".into()), None);
        h.detector.push(DetectResult::Interface(UPLINK.into()));
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.pending(), 2);

        // down(eth1) only
        assert!(h.mgr.process_next().await);
        assert_eq!(h.mgr.uplink_state(), UplinkState::Detecting);

        h.detector.push(DetectResult::Normal);
        h.mgr.run_detection_once().await.unwrap();
        assert_eq!(h.mgr.pending(), 1);

        h.mgr.process_pending().await;
        assert!(h.mgr.bridge(UPLINK).is_some());
        assert_eq!(h.mgr.uplink_state(), UplinkState::Up(UPLINK.to_string()));
    }

    fn crashing_harness() -> (Arc<CrashingHost>, Arc<RecordingOrchestrator>, Arc<VdpMgr>) {
        let host = Arc::new(CrashingHost {
            host: Arc::new(FakeHost::standard()),
            crash_on: parking_lot::Mutex::new(None),
        });
        let detector = Arc::new(ScriptedDetector::new(DetectResult::Undetected));
        let orch = Arc::new(RecordingOrchestrator::new());
        let mgr = VdpMgr::new(AgentConfig::default(), host.clone(), detector, orch.clone()).unwrap();
        mgr.notify_uplink_restart_state(Some(UPLINK.into()), None);
        (host, orch, mgr)
    }

    #[tokio::test]
    async fn test_panic_in_vm_event_reports_one_failure() {
        let (host, orch, mgr) = crashing_harness();
        mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();
        mgr.process_pending().await;
        assert!(mgr.bridge(UPLINK).is_some());

        let p1 = VmPortFixture::new(1, 10);
        p1.plug(&host.host);
        host.arm("iface-id");
        mgr.notify_vm_port_event(PortStatus::Up, &p1.port_id, &p1.mac, &p1.net_id, p1.segmentation_id, None)
            .unwrap();
        mgr.process_pending().await;

        let reports = orch.vm_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].port_id, p1.port_id);
        assert_eq!(reports[0].result, VmResult::CreateFailed);
        assert_eq!(mgr.pending_errors(), 0);

        // the bridge is still usable afterwards
        mgr.notify_vm_port_event(PortStatus::Down, &p1.port_id, &p1.mac, &p1.net_id, p1.segmentation_id, None)
            .unwrap();
        mgr.process_pending().await;
        assert_eq!(orch.vm_reports().len(), 2);
    }

    #[tokio::test]
    async fn test_panic_in_uplink_up_parks_message() {
        let (host, _orch, mgr) = crashing_harness();
        host.arm("br-exists");
        mgr.enqueue_uplink_event(UplinkStatus::Up, UPLINK).unwrap();
        mgr.process_pending().await;

        assert!(mgr.bridge(UPLINK).is_none());
        assert_eq!(mgr.pending_errors(), 1);

        assert_eq!(mgr.drain_error_queue(), 1);
        mgr.process_pending().await;
        assert!(mgr.bridge(UPLINK).is_some());
    }
}
