//! Uplink bridge with VDP-negotiated VLAN translation
//!
//! One `OvsVdp` exists per discovered uplink. It wires the uplink and the
//! protocol veth into the external bridge, steers LLDP/VDP frames to lldpad,
//! and for every network installs a flow pair translating the local VLAN of
//! the integration bridge to the provider VLAN granted by the switch:
//!
//! ```text
//! br-ex  priority=4 in_port=<phy-peer>,dl_vlan=<lvid>  -> mod_vlan_vid:<vdp>
//! br-int priority=3 in_port=<int-peer>,dl_vlan=<vdp>   -> mod_vlan_vid:<lvid>
//! ```
//!
//! Port events, VLAN change callbacks and the consistency check all run
//! under the bridge lock. The driver is only called with that lock held,
//! never the other way round.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use vdp_agent_common::{AgentError, AgentResult, CommandExecutor, Orchestrator, VmResult, VmResultReport};
use vdp_orch_common::PeriodicTask;

use crate::commands::*;
use crate::config::AgentConfig;
use crate::lldpad::{
    AssocRequest, LldpadDriver, VdpVsiRecord, VlanCallback, VlanCallbackData, VlanChangeHandler,
};
use crate::local_vlan::LocalVlan;
use crate::ovs_lib::{vlan_flow_present, OvsCtl};
use crate::rpc;
use crate::types::{failure_result, PortStatus, UplinkEvent, VmEvent};

/// Datapath port numbers cached at setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgePorts {
    pub phy_port: u32,
    pub lldp_port: u32,
    pub int_peer_port: u32,
    pub phy_peer_port: u32,
}

/// Protocol veth pair of an uplink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub ovs_side: String,
    pub local_side: String,
}

impl VethPair {
    pub fn for_uplink(uplink: &str) -> Self {
        let (ovs_side, local_side) = veth_names(uplink);
        Self { ovs_side, local_side }
    }
}

/// Entry restored from the orchestrator after an agent restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartEntry {
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    pub local_vlan: u16,
    pub provider_vlan: Option<u16>,
    pub segmentation_id: u32,
}

#[derive(Debug, Default)]
struct BridgeState {
    local_vlans: HashMap<String, LocalVlan>,
}

/// Forwards driver callbacks to the owning bridge without keeping it alive.
struct BridgeVlanHandler {
    bridge: Weak<OvsVdp>,
}

#[async_trait]
impl VlanChangeHandler for BridgeVlanHandler {
    async fn vlan_changed(&self, data: &VlanCallbackData, vlan: Option<u16>, fail_reason: Option<String>) {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.on_vlan_changed(data, vlan, fail_reason).await,
            None => debug!(port_id = %data.port_id, "VLAN change for a bridge already gone"),
        }
    }
}

/// Removes protocol flows and uplink/veth ports, logging instead of failing.
///
/// Used when setup fails half way and for uplink-down without a bridge.
pub async fn cleanup_stale(ovs: &OvsCtl, br_ex: &str, uplink: &str) {
    let veth = VethPair::for_uplink(uplink);
    for ethertype in PROTOCOL_ETHERTYPES {
        if let Err(e) = ovs.del_flows(br_ex, &protocol_flow_match(ethertype)).await {
            warn!(bridge = %br_ex, error = %e, "Failed to remove protocol flows");
        }
    }
    for port in [uplink, veth.ovs_side.as_str()] {
        if let Err(e) = ovs.del_port(br_ex, port).await {
            warn!(bridge = %br_ex, port = %port, error = %e, "Failed to remove port");
        }
    }
}

/// Switch side of one uplink
pub struct OvsVdp {
    uplink: String,
    br_int: String,
    br_ex: String,
    int_peer: String,
    phy_peer: String,
    veth: VethPair,
    ports: BridgePorts,
    ovs: OvsCtl,
    driver: Arc<LldpadDriver>,
    orchestrator: Arc<dyn Orchestrator>,
    state: Mutex<BridgeState>,
    flow_check: parking_lot::Mutex<Option<PeriodicTask>>,
    self_ref: Weak<OvsVdp>,
}

impl std::fmt::Debug for OvsVdp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvsVdp")
            .field("uplink", &self.uplink)
            .field("br_int", &self.br_int)
            .field("br_ex", &self.br_ex)
            .field("ports", &self.ports)
            .finish()
    }
}

impl OvsVdp {
    /// Builds the uplink path.
    ///
    /// Returns a bridge only when every step succeeded. A missing OVS bridge
    /// is [`AgentError::BridgeNotFound`]; any later failure removes whatever
    /// was added again and returns [`AgentError::BridgeSetup`].
    #[instrument(skip(exec, config, event, orchestrator), fields(uplink = %event.phy_uplink))]
    pub async fn setup(
        exec: Arc<dyn CommandExecutor>,
        config: &AgentConfig,
        event: &UplinkEvent,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> AgentResult<Arc<Self>> {
        let uplink = event.phy_uplink.as_str();
        let fail = |reason: String| AgentError::bridge_setup(uplink, reason);
        let ovs = OvsCtl::new(exec.clone(), &config.agent);

        for br in [&event.br_ex, &event.br_int] {
            if !ovs.bridge_exists(br).await.map_err(|e| fail(e.to_string()))? {
                return Err(AgentError::bridge_not_found(br.as_str()));
            }
        }

        let int_peer = int_peer_name(&event.br_ex);
        let phy_peer = phy_peer_name(&event.br_ex);
        for (port, bridge) in [(&int_peer, &event.br_int), (&phy_peer, &event.br_ex)] {
            let owner = ovs.port_to_br(port).await.map_err(|e| fail(e.to_string()))?;
            if owner.as_deref() != Some(bridge.as_str()) {
                return Err(fail(format!(
                    "no interconnect between {} and {}: {} is on {:?}",
                    event.br_int, event.br_ex, port, owner
                )));
            }
        }
        let int_peer_port = ovs.ofport(&int_peer).await.map_err(|e| fail(e.to_string()))?;
        let phy_peer_port = ovs.ofport(&phy_peer).await.map_err(|e| fail(e.to_string()))?;

        let veth = VethPair::for_uplink(uplink);
        let attached = Self::attach(&ovs, exec, config, event, &veth).await;
        let (phy_port, lldp_port, driver) = match attached {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Uplink setup failed, rolling back");
                cleanup_stale(&ovs, &event.br_ex, uplink).await;
                return Err(fail(e.to_string()));
            }
        };

        let bridge = Arc::new_cyclic(|self_ref| Self {
            uplink: uplink.to_string(),
            br_int: event.br_int.clone(),
            br_ex: event.br_ex.clone(),
            int_peer,
            phy_peer,
            veth,
            ports: BridgePorts {
                phy_port,
                lldp_port,
                int_peer_port,
                phy_peer_port,
            },
            ovs,
            driver,
            orchestrator,
            state: Mutex::new(BridgeState::default()),
            flow_check: parking_lot::Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let weak = Arc::downgrade(&bridge);
        let task = PeriodicTask::spawn(
            format!("flow-check-{}", uplink),
            config.flow_check_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(bridge) => bridge.check_flows_once().await,
                        None => Ok(()),
                    }
                }
            },
        );
        *bridge.flow_check.lock() = Some(task);

        info!(ports = ?bridge.ports, veth = %bridge.veth.local_side, "Uplink bridge ready");
        Ok(bridge)
    }

    /// Steps that add state to the switch: veth, ports, protocol flows, driver.
    async fn attach(
        ovs: &OvsCtl,
        exec: Arc<dyn CommandExecutor>,
        config: &AgentConfig,
        event: &UplinkEvent,
        veth: &VethPair,
    ) -> AgentResult<(u32, u32, Arc<LldpadDriver>)> {
        let br_ex = event.br_ex.as_str();

        if ovs.link_exists(&veth.ovs_side).await? {
            debug!(veth = %veth.ovs_side, "Reusing protocol veth");
        } else {
            ovs.create_veth(&veth.ovs_side, &veth.local_side).await?;
        }
        ovs.link_up(&veth.ovs_side).await?;
        ovs.link_up(&veth.local_side).await?;

        ovs.add_port(br_ex, &event.phy_uplink).await?;
        ovs.add_port(br_ex, &veth.ovs_side).await?;
        let phy_port = ovs.ofport(&event.phy_uplink).await?;
        let lldp_port = ovs.ofport(&veth.ovs_side).await?;

        for ethertype in PROTOCOL_ETHERTYPES {
            ovs.add_flow(br_ex, &protocol_flow(phy_port, lldp_port, ethertype))
                .await?;
            ovs.add_flow(br_ex, &protocol_flow(lldp_port, phy_port, ethertype))
                .await?;
        }

        let driver = LldpadDriver::start(
            exec,
            &config.agent,
            &config.vdp,
            &veth.local_side,
            config.refresh_interval(),
        )
        .await?;
        Ok((phy_port, lldp_port, driver))
    }

    pub fn uplink(&self) -> &str {
        &self.uplink
    }

    pub fn veth(&self) -> &VethPair {
        &self.veth
    }

    pub fn ports(&self) -> BridgePorts {
        self.ports
    }

    pub fn driver(&self) -> &Arc<LldpadDriver> {
        &self.driver
    }

    /// Snapshot of a network's bookkeeping.
    pub async fn local_vlan(&self, net_id: &str) -> Option<LocalVlan> {
        self.state.lock().await.local_vlans.get(net_id).cloned()
    }

    pub async fn network_count(&self) -> usize {
        self.state.lock().await.local_vlans.len()
    }

    fn callback_for(&self, ev: &VmEvent) -> VlanCallback {
        VlanCallback {
            handler: Arc::new(BridgeVlanHandler {
                bridge: self.self_ref.clone(),
            }),
            data: VlanCallbackData {
                port_id: ev.port_id.clone(),
                mac: ev.mac.clone(),
                net_id: ev.net_id.clone(),
                segmentation_id: ev.segmentation_id,
            },
        }
    }

    async fn install_flow_pair(&self, lvid: u16, vlan: u16) -> AgentResult<()> {
        self.ovs
            .add_flow(&self.br_ex, &outbound_flow(self.ports.phy_peer_port, lvid, vlan))
            .await?;
        self.ovs
            .add_flow(&self.br_int, &inbound_flow(self.ports.int_peer_port, vlan, lvid))
            .await
    }

    async fn remove_flow_pair(&self, lvid: u16, vlan: u16) -> AgentResult<()> {
        self.ovs
            .del_flows(&self.br_ex, &outbound_flow_match(self.ports.phy_peer_port, lvid))
            .await?;
        self.ovs
            .del_flows(&self.br_int, &inbound_flow_match(self.ports.int_peer_port, vlan))
            .await
    }

    /// Moves a network's flow pair to `vlan` (or removes it for `None`).
    ///
    /// On failure the network is flagged for renegotiation.
    async fn program_flows(&self, net_id: &str, lv: &mut LocalVlan, vlan: Option<u16>) -> bool {
        let mut result = Ok(());
        if let Some(old) = lv.late_binding_vlan.filter(|old| Some(*old) != vlan) {
            result = self.remove_flow_pair(lv.lvid, old).await;
        }
        if let (true, Some(new)) = (result.is_ok(), vlan) {
            result = self.install_flow_pair(lv.lvid, new).await;
        }
        lv.late_binding_vlan = vlan;
        match result {
            Ok(()) => {
                lv.vdp_nego_req = false;
                info!(net_id = %net_id, lvid = lv.lvid, vlan = ?vlan, "Programmed VLAN flows");
                true
            }
            Err(e) => {
                lv.vdp_nego_req = true;
                warn!(net_id = %net_id, error = %e, "Flow programming failed, renegotiation required");
                false
            }
        }
    }

    /// Handles a VM port plug or unplug.
    #[instrument(skip(self, ev), fields(port_id = %ev.port_id, net_id = %ev.net_id, status = ev.status.as_str()))]
    pub async fn send_port_event(&self, ev: &VmEvent) -> VmResultReport {
        let mut state = self.state.lock().await;
        match ev.status {
            PortStatus::Up => self.port_up(&mut state, ev).await,
            PortStatus::Down => self.port_down(&mut state, ev).await,
        }
    }

    async fn port_up(&self, state: &mut BridgeState, ev: &VmEvent) -> VmResultReport {
        let lvid = match self.ovs.lvid_for_port_id(&ev.port_id).await {
            Ok(Some(lvid)) => lvid,
            Ok(None) => {
                return VmResultReport::failure(&ev.port_id, VmResult::CreateFailed, "port has no local VLAN")
            }
            Err(e) => {
                return VmResultReport::failure(
                    &ev.port_id,
                    VmResult::CreateFailed,
                    format!("local VLAN lookup failed: {}", e),
                )
            }
        };

        let settled = state
            .local_vlans
            .get(&ev.net_id)
            .and_then(|lv| lv.is_settled().then_some(lv.late_binding_vlan).flatten());

        if let Some(vlan) = settled {
            return self.port_up_reuse(state, ev, vlan).await;
        }
        self.port_up_provision(state, ev, lvid).await
    }

    /// Joins a network whose provider VLAN is already accepted.
    async fn port_up_reuse(&self, state: &mut BridgeState, ev: &VmEvent, vlan: u16) -> VmResultReport {
        if self.driver.is_associated(&ev.port_id, Some(vlan)).await {
            debug!(vlan = vlan, "Port already associated");
        } else {
            let reply = self
                .driver
                .associate(AssocRequest {
                    port_id: ev.port_id.clone(),
                    mac: ev.mac.clone(),
                    net_id: ev.net_id.clone(),
                    gid: ev.segmentation_id,
                    vlan: Some(vlan),
                    oui: ev.oui.clone(),
                    wait_reply: false,
                    callback: Some(self.callback_for(ev)),
                })
                .await;
            if reply.vlan.is_none() {
                let reason = reply
                    .fail_reason
                    .unwrap_or_else(|| "association not sent".to_string());
                return VmResultReport::failure(&ev.port_id, VmResult::CreateFailed, reason);
            }
        }

        let Some(lv) = state.local_vlans.get_mut(&ev.net_id) else {
            return VmResultReport::failure(&ev.port_id, VmResult::CreateFailed, "network vanished");
        };
        lv.set_port_vlan(&ev.port_id, Some(vlan), None);
        info!(vlan = vlan, "Port joined network with existing VLAN");
        VmResultReport::success(&ev.port_id, Some(lv.lvid), Some(vlan))
    }

    /// Negotiates a provider VLAN with the switch and programs flows.
    async fn port_up_provision(&self, state: &mut BridgeState, ev: &VmEvent, lvid: u16) -> VmResultReport {
        let reply = self
            .driver
            .associate(AssocRequest {
                port_id: ev.port_id.clone(),
                mac: ev.mac.clone(),
                net_id: ev.net_id.clone(),
                gid: ev.segmentation_id,
                vlan: None,
                oui: ev.oui.clone(),
                wait_reply: true,
                callback: Some(self.callback_for(ev)),
            })
            .await;

        let lv = state
            .local_vlans
            .entry(ev.net_id.clone())
            .or_insert_with(|| LocalVlan::new(lvid));
        if lv.lvid != lvid {
            warn!(known = lv.lvid, reported = lvid, "Port reports a different local VLAN");
        }

        let Some(vlan) = reply.vlan else {
            let reason = reply
                .fail_reason
                .unwrap_or_else(|| "no VLAN granted".to_string());
            lv.set_port_vlan(&ev.port_id, None, Some(reason.clone()));
            return VmResultReport {
                port_id: ev.port_id.clone(),
                result: VmResult::CreateFailed,
                local_vlan: Some(lv.lvid),
                provider_vlan: None,
                fail_reason: Some(reason),
            };
        };

        lv.set_port_vlan(&ev.port_id, Some(vlan), None);
        let ok = if lv.late_binding_vlan != Some(vlan) || lv.vdp_nego_req {
            self.program_flows(&ev.net_id, lv, Some(vlan)).await
        } else {
            true
        };
        if ok {
            VmResultReport::success(&ev.port_id, Some(lv.lvid), Some(vlan))
        } else {
            VmResultReport {
                port_id: ev.port_id.clone(),
                result: VmResult::CreateFailed,
                local_vlan: Some(lv.lvid),
                provider_vlan: Some(vlan),
                fail_reason: Some("flow programming failed".to_string()),
            }
        }
    }

    async fn port_down(&self, state: &mut BridgeState, ev: &VmEvent) -> VmResultReport {
        let disassoc = self.driver.disassociate(&ev.port_id).await;

        let Some(lv) = state.local_vlans.get_mut(&ev.net_id) else {
            return match disassoc {
                Ok(_) => VmResultReport::success(&ev.port_id, None, None),
                Err(e) => VmResultReport::failure(&ev.port_id, failure_result(ev.status), e.to_string()),
            };
        };
        let removed = lv.remove_port(&ev.port_id);
        let lvid = lv.lvid;

        if lv.is_empty() {
            if let Some(vlan) = lv.late_binding_vlan {
                if let Err(e) = self.remove_flow_pair(lvid, vlan).await {
                    warn!(error = %e, "Failed to remove flows of last port");
                }
            }
            state.local_vlans.remove(&ev.net_id);
            info!(lvid = lvid, "Last port removed, network released");
        } else if lv.any_valid_vlan().is_none() {
            if lv.late_binding_vlan.is_some() {
                self.program_flows(&ev.net_id, lv, None).await;
            }
        } else if let Some(current) = lv.late_binding_vlan {
            if lv.vlan_ref_count(current) == 0 {
                if let Some(other) = lv.other_valid_vlan(Some(current)) {
                    info!(from = current, to = other, "Moving flows to VLAN still held by remaining ports");
                    self.program_flows(&ev.net_id, lv, Some(other)).await;
                }
            }
        }

        match disassoc {
            Ok(_) => VmResultReport::success(&ev.port_id, Some(lvid), removed.and_then(|p| p.vlan)),
            Err(e) => VmResultReport {
                port_id: ev.port_id.clone(),
                result: VmResult::DeleteFailed,
                local_vlan: Some(lvid),
                provider_vlan: None,
                fail_reason: Some(e.to_string()),
            },
        }
    }

    /// Applies a VLAN reassigned by the switch.
    #[instrument(skip(self, data), fields(port_id = %data.port_id, net_id = %data.net_id))]
    pub async fn on_vlan_changed(&self, data: &VlanCallbackData, vlan: Option<u16>, fail_reason: Option<String>) {
        let report = {
            let mut state = self.state.lock().await;
            let Some(lv) = state.local_vlans.get_mut(&data.net_id) else {
                debug!("Network unknown, ignoring VLAN change");
                return;
            };
            if !lv.has_port(&data.port_id) {
                debug!("Port unknown, ignoring VLAN change");
                return;
            }

            lv.set_port_vlan(&data.port_id, vlan, fail_reason.clone());
            match vlan {
                Some(new) if lv.late_binding_vlan != Some(new) || lv.vdp_nego_req => {
                    self.program_flows(&data.net_id, lv, Some(new)).await;
                }
                Some(_) => {}
                None => match lv.late_binding_vlan {
                    Some(current) if lv.vlan_ref_count(current) == 0 => {
                        let other = lv.other_valid_vlan(Some(current));
                        self.program_flows(&data.net_id, lv, other).await;
                    }
                    _ => {}
                },
            }

            match vlan {
                Some(new) => VmResultReport::success(&data.port_id, Some(lv.lvid), Some(new)),
                None => VmResultReport {
                    port_id: data.port_id.clone(),
                    result: VmResult::CreateFailed,
                    local_vlan: Some(lv.lvid),
                    provider_vlan: None,
                    fail_reason: Some(fail_reason.unwrap_or_else(|| "switch withdrew VLAN".to_string())),
                },
            }
        };

        rpc::report_vm_result(self.orchestrator.as_ref(), report).await;
    }

    /// Re-adds VLAN flows missing from either bridge.
    ///
    /// Only networks whose VLAN is settled are checked; stale flows are not
    /// looked for.
    pub async fn check_flows_once(&self) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        let settled: Vec<String> = state
            .local_vlans
            .iter()
            .filter(|(_, lv)| lv.is_settled())
            .map(|(net, _)| net.clone())
            .collect();
        if settled.is_empty() {
            return Ok(());
        }

        let ex_flows = self.ovs.dump_flows(&self.br_ex).await?;
        let int_flows = self.ovs.dump_flows(&self.br_int).await?;

        for net_id in settled {
            let Some(lv) = state.local_vlans.get_mut(&net_id) else {
                continue;
            };
            let Some(vlan) = lv.late_binding_vlan else {
                continue;
            };
            let lvid = lv.lvid;

            let mut result = Ok(());
            if !vlan_flow_present(&ex_flows, self.ports.phy_peer_port, &self.phy_peer, lvid, vlan) {
                warn!(net_id = %net_id, bridge = %self.br_ex, "Outbound flow missing, re-adding");
                result = self
                    .ovs
                    .add_flow(&self.br_ex, &outbound_flow(self.ports.phy_peer_port, lvid, vlan))
                    .await;
            }
            if result.is_ok()
                && !vlan_flow_present(&int_flows, self.ports.int_peer_port, &self.int_peer, vlan, lvid)
            {
                warn!(net_id = %net_id, bridge = %self.br_int, "Inbound flow missing, re-adding");
                result = self
                    .ovs
                    .add_flow(&self.br_int, &inbound_flow(self.ports.int_peer_port, vlan, lvid))
                    .await;
            }
            if let Err(e) = result {
                warn!(net_id = %net_id, error = %e, "Flow repair failed, renegotiation required");
                lv.vdp_nego_req = true;
            }
        }
        Ok(())
    }

    /// Restores one port after an agent restart without negotiating.
    pub async fn populate_cache(&self, entry: &RestartEntry) {
        {
            let mut state = self.state.lock().await;
            let lv = state
                .local_vlans
                .entry(entry.net_id.clone())
                .or_insert_with(|| LocalVlan::new(entry.local_vlan));
            lv.set_port_vlan(&entry.port_id, entry.provider_vlan, None);
            if lv.late_binding_vlan.is_none() {
                lv.late_binding_vlan = entry.provider_vlan;
            }
        }

        let ev = VmEvent {
            port_id: entry.port_id.clone(),
            mac: entry.mac.clone(),
            net_id: entry.net_id.clone(),
            segmentation_id: entry.segmentation_id,
            status: PortStatus::Up,
            oui: None,
            phy_uplink: Some(self.uplink.clone()),
        };
        let req = AssocRequest {
            port_id: ev.port_id.clone(),
            mac: ev.mac.clone(),
            net_id: ev.net_id.clone(),
            gid: ev.segmentation_id,
            vlan: entry.provider_vlan,
            oui: None,
            wait_reply: false,
            callback: Some(self.callback_for(&ev)),
        };
        self.driver
            .register_vsi(VdpVsiRecord::new(&req, self.driver.identity(), entry.provider_vlan))
            .await;
        info!(port_id = %entry.port_id, net_id = %entry.net_id, vlan = ?entry.provider_vlan, "Restored port from cache");
    }

    /// Stops background work and removes the uplink path.
    ///
    /// The protocol veth is left in place so its MAC survives the next
    /// uplink-up.
    #[instrument(skip(self), fields(uplink = %self.uplink))]
    pub async fn shutdown(&self) {
        if let Some(task) = self.flow_check.lock().take() {
            task.stop();
        }
        self.driver.shutdown();
        cleanup_stale(&self.ovs, &self.br_ex, &self.uplink).await;
        info!("Uplink bridge torn down");
    }
}

impl Drop for OvsVdp {
    fn drop(&mut self) {
        if let Some(task) = self.flow_check.get_mut().take() {
            task.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vdp_agent_test::{FakeHost, RecordingOrchestrator, BR_EX, BR_INT, UPLINK};

    const NET1: &str = "n1";
    const P1: &str = "0b7bd1a8-4ae1-4b13-9f12-0f0e3e6f2a11";
    const P2: &str = "5d0c0d2f-8b35-4a8c-a3a1-2b2cf8b6e0a2";

    fn uplink_event() -> UplinkEvent {
        UplinkEvent::new(crate::types::UplinkStatus::Up, UPLINK, BR_INT, BR_EX).unwrap()
    }

    fn vm(port: &str, mac: &str, status: PortStatus) -> VmEvent {
        VmEvent::new(port, mac, NET1, 100, status, None, Some(UPLINK.to_string())).unwrap()
    }

    async fn bridge_on(host: &Arc<FakeHost>) -> (Arc<OvsVdp>, Arc<RecordingOrchestrator>) {
        let orch = Arc::new(RecordingOrchestrator::new());
        let bridge = OvsVdp::setup(host.clone(), &AgentConfig::default(), &uplink_event(), orch.clone())
            .await
            .unwrap();
        (bridge, orch)
    }

    #[tokio::test]
    async fn test_setup_wires_uplink() {
        let host = Arc::new(FakeHost::standard());
        let (bridge, _) = bridge_on(&host).await;

        assert!(host.port_on_bridge(BR_EX, UPLINK));
        assert!(host.port_on_bridge(BR_EX, "vdpo-eth2"));
        assert!(host.link_exists("vdpl-eth2"));
        assert_eq!(host.flows_matching(BR_EX, "priority=50000").len(), 4);
        assert_eq!(bridge.veth().local_side, "vdpl-eth2");
        assert!(host.has_command("-V vdp -c enableTx=yes"));
    }

    #[tokio::test]
    async fn test_setup_reuses_existing_veth() {
        let host = Arc::new(FakeHost::standard());
        host.add_link("vdpo-eth2");
        host.add_link("vdpl-eth2");
        let _ = bridge_on(&host).await;
        assert!(host.commands_matching("type veth").is_empty());
    }

    #[tokio::test]
    async fn test_setup_missing_bridge() {
        let host = Arc::new(FakeHost::new());
        host.add_bridge(BR_INT);
        let orch = Arc::new(RecordingOrchestrator::new());
        let err = OvsVdp::setup(host.clone(), &AgentConfig::default(), &uplink_event(), orch)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BridgeNotFound { .. }));
        assert!(err.to_string().contains(BR_EX));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_setup_missing_interconnect() {
        let host = Arc::new(FakeHost::new());
        host.add_bridge(BR_INT);
        host.add_bridge(BR_EX);
        host.add_link(UPLINK);
        let orch = Arc::new(RecordingOrchestrator::new());
        let err = OvsVdp::setup(host.clone(), &AgentConfig::default(), &uplink_event(), orch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("interconnect"));
    }

    #[tokio::test]
    async fn test_setup_rolls_back() {
        let host = Arc::new(FakeHost::standard());
        host.fail_always("evbgpid", 1);
        let orch = Arc::new(RecordingOrchestrator::new());
        let err = OvsVdp::setup(host.clone(), &AgentConfig::default(), &uplink_event(), orch)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BridgeSetup { .. }));
        assert!(!host.port_on_bridge(BR_EX, UPLINK));
        assert!(!host.port_on_bridge(BR_EX, "vdpo-eth2"));
        assert!(host.flows_matching(BR_EX, "priority=50000").is_empty());
    }

    #[tokio::test]
    async fn test_provision_and_release() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, _) = bridge_on(&host).await;

        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up))
            .await;
        assert_eq!(report, VmResultReport::success(P1, Some(10), Some(3003)));
        assert!(host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        let lv = bridge.local_vlan(NET1).await.unwrap();
        assert_eq!(lv.late_binding_vlan, Some(3003));
        assert!(!lv.vdp_nego_req);

        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Down))
            .await;
        assert!(report.is_success());
        assert!(!host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        assert!(host.flows_matching(BR_INT, "dl_vlan=3003").is_empty());
        assert_eq!(bridge.local_vlan(NET1).await, None);
    }

    #[tokio::test]
    async fn test_no_vlan_granted() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.set_switch_vlan(100, None);
        let (bridge, _) = bridge_on(&host).await;

        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up))
            .await;
        assert_eq!(report.result, VmResult::CreateFailed);
        assert!(report.fail_reason.is_some());
        let lv = bridge.local_vlan(NET1).await.unwrap();
        assert!(lv.has_port(P1));
        assert_eq!(lv.late_binding_vlan, None);
        assert!(host.flows_matching(BR_EX, "priority=4").is_empty());
    }

    #[tokio::test]
    async fn test_port_without_local_vlan() {
        let host = Arc::new(FakeHost::standard());
        let (bridge, _) = bridge_on(&host).await;
        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up))
            .await;
        assert_eq!(report.result, VmResult::CreateFailed);
        assert_eq!(bridge.network_count().await, 0);
    }

    #[tokio::test]
    async fn test_flow_failure_requests_renegotiation() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.add_vm_port(P2, "tap2", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, _) = bridge_on(&host).await;

        host.fail_once("mod_vlan_vid:3003", 1);
        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up))
            .await;
        assert_eq!(report.result, VmResult::CreateFailed);
        assert!(bridge.local_vlan(NET1).await.unwrap().vdp_nego_req);

        // next port renegotiates and installs the pair
        let report = bridge
            .send_port_event(&vm(P2, "fa:16:3e:00:00:02", PortStatus::Up))
            .await;
        assert!(report.is_success());
        assert!(host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        assert!(!bridge.local_vlan(NET1).await.unwrap().vdp_nego_req);
    }

    #[tokio::test]
    async fn test_down_reprograms_to_remaining_vlan() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.add_vm_port(P2, "tap2", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, _) = bridge_on(&host).await;

        bridge.send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up)).await;
        bridge.send_port_event(&vm(P2, "fa:16:3e:00:00:02", PortStatus::Up)).await;

        // P2 alone learns of a new VLAN; P1 still holds the installed one
        let data = VlanCallbackData {
            port_id: P2.to_string(),
            mac: "fa:16:3e:00:00:02".to_string(),
            net_id: NET1.to_string(),
            segmentation_id: 100,
        };
        bridge.on_vlan_changed(&data, Some(3010), None).await;
        assert!(host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3010));

        // P2 goes away, leaving P1 on 3003 which no flow carries
        bridge.send_port_event(&vm(P2, "fa:16:3e:00:00:02", PortStatus::Down)).await;
        let lv = bridge.local_vlan(NET1).await.unwrap();
        assert_eq!(lv.late_binding_vlan, Some(3003));
        assert!(host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        assert!(!host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3010));
    }

    #[tokio::test]
    async fn test_vlan_withdrawn_removes_flows() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, orch) = bridge_on(&host).await;
        bridge.send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up)).await;

        let data = VlanCallbackData {
            port_id: P1.to_string(),
            mac: "fa:16:3e:00:00:01".to_string(),
            net_id: NET1.to_string(),
            segmentation_id: 100,
        };
        bridge.on_vlan_changed(&data, None, Some("switch reload".into())).await;

        assert!(!host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        let lv = bridge.local_vlan(NET1).await.unwrap();
        assert_eq!(lv.late_binding_vlan, None);
        assert!(lv.has_port(P1));
        let last = orch.vm_reports().last().cloned().unwrap();
        assert_eq!(last.result, VmResult::CreateFailed);
        assert_eq!(last.fail_reason.as_deref(), Some("switch reload"));
    }

    #[tokio::test]
    async fn test_consistency_check_readds_missing_direction() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, _) = bridge_on(&host).await;
        bridge.send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up)).await;

        host.remove_flows(BR_INT, "dl_vlan=3003");
        let adds_before = host.commands_matching("add-flow").len();
        bridge.check_flows_once().await.unwrap();

        assert!(host.vlan_flow_pair_installed(BR_INT, BR_EX, 10, 3003));
        let adds = host.commands_matching("add-flow");
        assert_eq!(adds.len(), adds_before + 1);
        assert!(adds.last().unwrap().contains(BR_INT));
        assert_eq!(host.commands_matching("dump-flows").len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_veth() {
        let host = Arc::new(FakeHost::standard());
        let (bridge, _) = bridge_on(&host).await;
        bridge.shutdown().await;

        assert!(!host.port_on_bridge(BR_EX, UPLINK));
        assert!(!host.port_on_bridge(BR_EX, "vdpo-eth2"));
        assert!(host.flows_matching(BR_EX, "priority=50000").is_empty());
        assert!(host.link_exists("vdpo-eth2"));
    }

    #[tokio::test]
    async fn test_populate_cache_then_reuse() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port(P1, "tap1", 10);
        host.set_switch_vlan(100, Some(3003));
        let (bridge, _) = bridge_on(&host).await;

        bridge
            .populate_cache(&RestartEntry {
                port_id: P1.to_string(),
                mac: "fa:16:3e:00:00:01".to_string(),
                net_id: NET1.to_string(),
                local_vlan: 10,
                provider_vlan: Some(3003),
                segmentation_id: 100,
            })
            .await;
        assert!(host.commands_matching("mode=assoc").is_empty());

        let report = bridge
            .send_port_event(&vm(P1, "fa:16:3e:00:00:01", PortStatus::Up))
            .await;
        assert!(report.is_success());
        assert!(host.commands_matching("mode=assoc").is_empty());
    }
}
