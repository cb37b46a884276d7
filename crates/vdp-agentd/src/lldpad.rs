//! VDP protocol driver on top of lldpad
//!
//! `LldpadDriver` owns the protocol veth of one uplink. It enables LLDP,
//! EVB and VDP on it, sends VSI associate/disassociate requests through
//! `lldptool`, and periodically re-associates every known VSI so that a
//! VLAN reassigned by the switch is noticed.
//!
//! Locking: the VSI table lock is only held to look up or remove entries.
//! Each entry has its own lock, held while its command runs. Callbacks run
//! with no driver lock held.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use vdp_agent_common::{AgentResult, CommandExecutor};
use vdp_orch_common::PeriodicTask;

use crate::commands::*;
use crate::config::{
    AgentToolsConfig, VdpConfig, FILTER_FRMT_GIDVID, FILTER_FRMT_MACVID, FILTER_FRMT_VID,
};
use crate::reply::{parse_assoc_reply, AssocReply};
use crate::types::OuiData;

/// Manager and type identifiers sent with every VSI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsiIdentity {
    pub mgrid: u32,
    pub typeid: u32,
    pub typeid_ver: u32,
    pub vsiid_frmt: u8,
    pub filter_frmt: u8,
}

impl VsiIdentity {
    pub fn from_config(vdp: &VdpConfig) -> Self {
        Self {
            mgrid: vdp.mgrid,
            typeid: vdp.typeid,
            typeid_ver: vdp.typeid_ver,
            vsiid_frmt: vdp.vsiid_frmt,
            filter_frmt: vdp.filter_frmt,
        }
    }

    /// Filter clause for a VSI; an unknown VLAN is sent as 0.
    pub fn filter(&self, vlan: Option<u16>, mac: &str, gid: u32) -> String {
        let vlan = vlan.unwrap_or(0);
        match self.filter_frmt {
            FILTER_FRMT_VID => format!("{}", vlan),
            FILTER_FRMT_MACVID => format!("{}-{}", vlan, mac),
            FILTER_FRMT_GIDVID => format!("{}-{}", vlan, gid),
            _ => format!("{}-{}-{}", vlan, mac, gid),
        }
    }
}

/// Context handed back when the switch changes a VSI's VLAN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanCallbackData {
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    pub segmentation_id: u32,
}

/// Receiver of switch-initiated VLAN changes.
#[async_trait]
pub trait VlanChangeHandler: Send + Sync {
    async fn vlan_changed(&self, data: &VlanCallbackData, vlan: Option<u16>, fail_reason: Option<String>);
}

/// A registered VLAN change callback.
#[derive(Clone)]
pub struct VlanCallback {
    pub handler: Arc<dyn VlanChangeHandler>,
    pub data: VlanCallbackData,
}

impl std::fmt::Debug for VlanCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlanCallback").field("data", &self.data).finish()
    }
}

/// One association request.
#[derive(Debug, Clone)]
pub struct AssocRequest {
    /// VSI id (the VM port UUID)
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    /// Group id, the network's segmentation id
    pub gid: u32,
    /// VLAN to announce, if already known
    pub vlan: Option<u16>,
    pub oui: Option<OuiData>,
    /// Wait for the switch's answer (`-W`)
    pub wait_reply: bool,
    pub callback: Option<VlanCallback>,
}

/// Protocol state of one VSI.
#[derive(Debug, Clone)]
pub struct VdpVsiRecord {
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    pub identity: VsiIdentity,
    pub gid: u32,
    /// Last VLAN the switch granted
    pub vlan: Option<u16>,
    pub oui: Option<OuiData>,
    pub callback: Option<VlanCallback>,
    removed: bool,
}

impl VdpVsiRecord {
    pub fn new(req: &AssocRequest, identity: VsiIdentity, vlan: Option<u16>) -> Self {
        Self {
            port_id: req.port_id.clone(),
            mac: req.mac.clone(),
            net_id: req.net_id.clone(),
            identity,
            gid: req.gid,
            vlan,
            oui: req.oui.clone(),
            callback: req.callback.clone(),
            removed: false,
        }
    }
}

type VsiEntry = Arc<Mutex<VdpVsiRecord>>;

/// lldpad-backed VDP driver for one protocol veth
pub struct LldpadDriver {
    exec: Arc<dyn CommandExecutor>,
    lldptool: String,
    veth: String,
    identity: VsiIdentity,
    vsis: Mutex<HashMap<String, VsiEntry>>,
    refresh: parking_lot::Mutex<Option<PeriodicTask>>,
}

impl LldpadDriver {
    /// Enables LLDP, EVB and VDP on `veth` and starts the refresh task.
    pub async fn start(
        exec: Arc<dyn CommandExecutor>,
        tools: &AgentToolsConfig,
        vdp: &VdpConfig,
        veth: &str,
        refresh_interval: Duration,
    ) -> AgentResult<Arc<Self>> {
        let lldptool = tools.lldptool.clone();
        for argv in [
            build_lldp_admin_cmd(&lldptool, veth),
            build_evb_enable_cmd(&lldptool, veth),
            build_evb_gpid_cmd(&lldptool, veth),
            build_vdp_enable_cmd(&lldptool, veth),
        ] {
            exec.execute(&argv, true).await?;
        }
        info!(veth = %veth, "Enabled LLDP/EVB/VDP");

        let driver = Arc::new(Self {
            exec,
            lldptool,
            veth: veth.to_string(),
            identity: VsiIdentity::from_config(vdp),
            vsis: Mutex::new(HashMap::new()),
            refresh: parking_lot::Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&driver);
        let task = PeriodicTask::spawn(format!("vdp-refresh-{}", veth), refresh_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(driver) = weak.upgrade() {
                    driver.refresh_once().await;
                }
                Ok::<_, String>(())
            }
        });
        *driver.refresh.lock() = Some(task);

        Ok(driver)
    }

    pub fn veth(&self) -> &str {
        &self.veth
    }

    pub fn identity(&self) -> VsiIdentity {
        self.identity
    }

    fn assoc_keywords(&self, record: &VdpVsiRecord, mode: &str, vlan: Option<u16>) -> Vec<String> {
        let id = &record.identity;
        let mut kws = vec![
            format!("mode={}", mode),
            format!("mgrid2={}", id.mgrid),
            format!("typeid={}", id.typeid),
            format!("typeidver={}", id.typeid_ver),
            format!("uuid={}", record.port_id),
            "hints=none".to_string(),
            format!("filter={}", id.filter(vlan, &record.mac, record.gid)),
        ];
        if let Some(oui) = &record.oui {
            kws.extend(oui.to_lldptool_args());
        }
        kws
    }

    /// Sends one associate and interprets the answer.
    ///
    /// Command failures are returned; reply problems are folded into the
    /// returned [`AssocReply`].
    async fn send_assoc(&self, record: &VdpVsiRecord, vlan: Option<u16>, wait_reply: bool) -> AgentResult<AssocReply> {
        let kws = self.assoc_keywords(record, "assoc", vlan);
        let argv = build_vdp_cmd(&self.lldptool, &self.veth, wait_reply, &kws);
        let out = self.exec.execute(&argv, true).await?;
        if !wait_reply {
            return Ok(AssocReply {
                vlan,
                fail_reason: None,
            });
        }
        Ok(parse_assoc_reply(&out, &record.port_id))
    }

    /// Associates a VSI.
    ///
    /// The VSI is recorded whenever lldpad accepted the command, even without
    /// a VLAN, so the refresh task can pick up a late grant.
    #[instrument(skip(self, req), fields(port_id = %req.port_id, wait = req.wait_reply))]
    pub async fn associate(&self, req: AssocRequest) -> AssocReply {
        let entry = self.vsis.lock().await.get(&req.port_id).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let record = VdpVsiRecord::new(&req, self.identity, None);
                let mut vsis = self.vsis.lock().await;
                vsis.entry(req.port_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(record)))
                    .clone()
            }
        };

        let mut record = entry.lock().await;
        record.mac = req.mac.clone();
        record.net_id = req.net_id.clone();
        record.gid = req.gid;
        record.oui = req.oui.clone();
        if req.callback.is_some() {
            record.callback = req.callback.clone();
        }
        record.removed = false;

        match self.send_assoc(&record, req.vlan, req.wait_reply).await {
            Ok(reply) => {
                record.vlan = reply.vlan;
                match reply.vlan {
                    Some(vlan) => info!(vlan = vlan, "VSI associated"),
                    None => warn!(
                        reason = reply.fail_reason.as_deref().unwrap_or("unknown"),
                        "VSI association returned no VLAN"
                    ),
                }
                reply
            }
            Err(e) => {
                warn!(error = %e, "VSI associate command failed");
                record.removed = true;
                drop(record);
                let mut vsis = self.vsis.lock().await;
                if vsis.get(&req.port_id).is_some_and(|cur| Arc::ptr_eq(cur, &entry)) {
                    vsis.remove(&req.port_id);
                }
                AssocReply::failed(e.to_string())
            }
        }
    }

    /// Disassociates a VSI. Unknown ports are a no-op and return `false`.
    #[instrument(skip(self))]
    pub async fn disassociate(&self, port_id: &str) -> AgentResult<bool> {
        let Some(entry) = self.vsis.lock().await.remove(port_id) else {
            debug!("VSI not associated, nothing to do");
            return Ok(false);
        };

        let mut record = entry.lock().await;
        record.removed = true;
        let kws = self.assoc_keywords(&record, "deassoc", record.vlan);
        let argv = build_vdp_cmd(&self.lldptool, &self.veth, false, &kws);
        self.exec.execute(&argv, true).await?;
        info!("VSI disassociated");
        Ok(true)
    }

    /// Records a VSI that is already associated on the switch without
    /// sending anything.
    pub async fn register_vsi(&self, record: VdpVsiRecord) {
        debug!(port_id = %record.port_id, vlan = ?record.vlan, "Registered VSI");
        self.vsis
            .lock()
            .await
            .insert(record.port_id.clone(), Arc::new(Mutex::new(record)));
    }

    /// Last VLAN granted to a port, `None` if the port is unknown.
    pub async fn vsi_vlan(&self, port_id: &str) -> Option<Option<u16>> {
        let entry = self.vsis.lock().await.get(port_id).cloned()?;
        let record = entry.lock().await;
        Some(record.vlan)
    }

    /// True when the port is associated at exactly `vlan`.
    pub async fn is_associated(&self, port_id: &str, vlan: Option<u16>) -> bool {
        vlan.is_some() && self.vsi_vlan(port_id).await == Some(vlan)
    }

    pub async fn vsi_count(&self) -> usize {
        self.vsis.lock().await.len()
    }

    /// Re-associates every VSI and reports VLAN changes.
    ///
    /// A failing VSI does not stop the pass.
    pub async fn refresh_once(&self) {
        let entries: Vec<VsiEntry> = self.vsis.lock().await.values().cloned().collect();
        if entries.is_empty() {
            return;
        }
        debug!(veth = %self.veth, count = entries.len(), "Refreshing VSIs");

        for entry in entries {
            let mut record = entry.lock().await;
            if record.removed {
                continue;
            }
            let reply = match self.send_assoc(&record, None, true).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(port_id = %record.port_id, error = %e, "VSI refresh failed");
                    continue;
                }
            };
            if reply.vlan == record.vlan {
                continue;
            }

            info!(
                port_id = %record.port_id,
                old_vlan = ?record.vlan,
                new_vlan = ?reply.vlan,
                "Switch changed VSI VLAN"
            );
            record.vlan = reply.vlan;
            let callback = record.callback.clone();
            drop(record);

            if let Some(cb) = callback {
                cb.handler
                    .vlan_changed(&cb.data, reply.vlan, reply.fail_reason)
                    .await;
            }
        }
    }

    /// Stops the refresh task.
    pub fn shutdown(&self) {
        if let Some(task) = self.refresh.lock().take() {
            task.stop();
        }
        info!(veth = %self.veth, "VDP driver stopped");
    }
}

impl Drop for LldpadDriver {
    fn drop(&mut self) {
        if let Some(task) = self.refresh.get_mut().take() {
            task.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use vdp_agent_test::{FakeHost, ReplyFormat};

    const P1: &str = "0b7bd1a8-4ae1-4b13-9f12-0f0e3e6f2a11";
    const MAC1: &str = "fa:16:3e:00:00:01";

    #[derive(Default)]
    struct RecordingHandler {
        calls: SyncMutex<Vec<(String, Option<u16>)>>,
    }

    #[async_trait]
    impl VlanChangeHandler for RecordingHandler {
        async fn vlan_changed(&self, data: &VlanCallbackData, vlan: Option<u16>, _fail_reason: Option<String>) {
            self.calls.lock().push((data.port_id.clone(), vlan));
        }
    }

    async fn driver_on(host: &Arc<FakeHost>) -> Arc<LldpadDriver> {
        LldpadDriver::start(
            host.clone(),
            &AgentToolsConfig::default(),
            &VdpConfig::default(),
            "vdpl-eth2",
            Duration::from_secs(3600),
        )
        .await
        .unwrap()
    }

    fn request(port: &str, wait: bool, callback: Option<VlanCallback>) -> AssocRequest {
        AssocRequest {
            port_id: port.to_string(),
            mac: MAC1.to_string(),
            net_id: "n1".to_string(),
            gid: 100,
            vlan: None,
            oui: None,
            wait_reply: wait,
            callback,
        }
    }

    #[test]
    fn test_filter_formats() {
        let mut id = VsiIdentity::from_config(&VdpConfig::default());
        assert_eq!(id.filter(None, MAC1, 100), "0-fa:16:3e:00:00:01-100");
        id.filter_frmt = FILTER_FRMT_VID;
        assert_eq!(id.filter(Some(3003), MAC1, 100), "3003");
        id.filter_frmt = FILTER_FRMT_MACVID;
        assert_eq!(id.filter(Some(3003), MAC1, 100), "3003-fa:16:3e:00:00:01");
        id.filter_frmt = FILTER_FRMT_GIDVID;
        assert_eq!(id.filter(Some(3003), MAC1, 100), "3003-100");
    }

    #[tokio::test]
    async fn test_start_enables_protocols() {
        let host = Arc::new(FakeHost::standard());
        let driver = driver_on(&host).await;
        assert_eq!(host.commands_matching("lldptool").len(), 4);
        assert!(host.has_command("adminStatus=rxtx"));
        assert!(host.has_command("evbgpid=yes"));
        driver.shutdown();
    }

    #[tokio::test]
    async fn test_associate_grants_vlan() {
        let host = Arc::new(FakeHost::standard());
        host.set_switch_vlan(100, Some(3003));
        let driver = driver_on(&host).await;

        let reply = driver.associate(request(P1, true, None)).await;
        assert_eq!(reply, AssocReply::granted(3003));
        assert!(driver.is_associated(P1, Some(3003)).await);

        let cmd = host.last_command_matching("mode=assoc").unwrap();
        assert!(cmd.contains("-W"));
        assert!(cmd.contains(&format!("uuid={}", P1)));
        assert!(cmd.contains("filter=0-fa:16:3e:00:00:01-100"));
    }

    #[tokio::test]
    async fn test_associate_legacy_reply() {
        let host = Arc::new(FakeHost::standard());
        host.set_reply_format(ReplyFormat::Legacy);
        host.set_switch_vlan(100, Some(3003));
        let driver = driver_on(&host).await;
        assert_eq!(driver.associate(request(P1, true, None)).await.vlan, Some(3003));
    }

    #[tokio::test]
    async fn test_rejected_association_kept_for_refresh() {
        let host = Arc::new(FakeHost::standard());
        host.set_switch_vlan(100, None);
        let driver = driver_on(&host).await;

        let reply = driver.associate(request(P1, true, None)).await;
        assert_eq!(reply.vlan, None);
        assert!(reply.fail_reason.is_some());
        assert_eq!(driver.vsi_vlan(P1).await, Some(None));
    }

    #[tokio::test]
    async fn test_command_failure_not_recorded() {
        let host = Arc::new(FakeHost::standard());
        let driver = driver_on(&host).await;
        host.fail_always("mode=assoc", 1);

        let reply = driver.associate(request(P1, true, None)).await;
        assert_eq!(reply.vlan, None);
        assert_eq!(driver.vsi_count().await, 0);
    }

    #[tokio::test]
    async fn test_disassociate_unknown_is_noop() {
        let host = Arc::new(FakeHost::standard());
        let driver = driver_on(&host).await;
        assert!(!driver.disassociate("unknown").await.unwrap());
        assert!(host.commands_matching("mode=deassoc").is_empty());
    }

    #[tokio::test]
    async fn test_disassociate_known() {
        let host = Arc::new(FakeHost::standard());
        host.set_switch_vlan(100, Some(3003));
        let driver = driver_on(&host).await;
        driver.associate(request(P1, true, None)).await;

        assert!(driver.disassociate(P1).await.unwrap());
        assert_eq!(driver.vsi_vlan(P1).await, None);
        let cmd = host.last_command_matching("mode=deassoc").unwrap();
        assert!(!cmd.contains("-W"));
        assert!(cmd.contains("filter=3003-"));
    }

    #[tokio::test]
    async fn test_refresh_reports_changes_only() {
        let host = Arc::new(FakeHost::standard());
        host.set_switch_vlan(100, Some(3003));
        let driver = driver_on(&host).await;
        let handler = Arc::new(RecordingHandler::default());
        let cb = VlanCallback {
            handler: handler.clone(),
            data: VlanCallbackData {
                port_id: P1.to_string(),
                mac: MAC1.to_string(),
                net_id: "n1".to_string(),
                segmentation_id: 100,
            },
        };
        driver.associate(request(P1, true, Some(cb))).await;

        driver.refresh_once().await;
        assert!(handler.calls.lock().is_empty());

        host.set_switch_vlan(100, Some(3010));
        driver.refresh_once().await;
        assert_eq!(*handler.calls.lock(), vec![(P1.to_string(), Some(3010))]);
        assert_eq!(driver.vsi_vlan(P1).await, Some(Some(3010)));

        host.set_switch_vlan(100, None);
        driver.refresh_once().await;
        assert_eq!(handler.calls.lock().last().cloned(), Some((P1.to_string(), None)));
    }

    #[tokio::test]
    async fn test_refresh_failure_does_not_abort_pass() {
        let host = Arc::new(FakeHost::standard());
        host.set_switch_vlan(100, Some(3003));
        let driver = driver_on(&host).await;
        let p2 = "5d0c0d2f-8b35-4a8c-a3a1-2b2cf8b6e0a2";
        driver.associate(request(P1, true, None)).await;
        let mut req2 = request(p2, true, None);
        req2.mac = "fa:16:3e:00:00:02".to_string();
        driver.associate(req2).await;

        host.fail_always(&format!("uuid={}", P1), 1);
        host.set_switch_vlan(100, Some(3010));
        driver.refresh_once().await;

        assert_eq!(driver.vsi_vlan(P1).await, Some(Some(3003)));
        assert_eq!(driver.vsi_vlan(p2).await, Some(Some(3010)));
    }

    #[tokio::test]
    async fn test_register_vsi_sends_nothing() {
        let host = Arc::new(FakeHost::standard());
        let driver = driver_on(&host).await;
        let before = host.commands().len();

        let req = request(P1, false, None);
        driver
            .register_vsi(VdpVsiRecord::new(&req, driver.identity(), Some(3003)))
            .await;
        assert_eq!(host.commands().len(), before);
        assert!(driver.is_associated(P1, Some(3003)).await);
    }
}
