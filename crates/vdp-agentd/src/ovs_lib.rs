//! Open vSwitch and link primitives
//!
//! Thin async wrappers over `ovs-vsctl`, `ovs-ofctl` and `ip`, executed
//! through the agent's [`CommandExecutor`]. Every command runs with the
//! privilege helper.

use std::sync::Arc;
use tracing::{debug, info};

use vdp_agent_common::{AgentError, AgentResult, CommandExecutor};

use crate::commands::*;
use crate::config::AgentToolsConfig;

/// Exit code of `ovs-vsctl br-exists` for a missing bridge
const BR_ABSENT_EXIT_CODE: i32 = 2;

/// One line of `ovs-ofctl dump-flows` output, reduced to the fields the
/// agent compares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpedFlow {
    pub priority: Option<u16>,
    /// Port number or quoted port name, as printed by OVS
    pub in_port: Option<String>,
    pub dl_vlan: Option<u16>,
    pub mod_vlan_vid: Option<u16>,
    pub raw: String,
}

impl DumpedFlow {
    /// Parses one dump line. Header lines and blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (matches, actions) = line.split_once(" actions=")?;

        let mut flow = DumpedFlow {
            raw: line.to_string(),
            ..Default::default()
        };
        for field in matches.split([',', ' ']).filter(|f| !f.is_empty()) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "priority" => flow.priority = value.parse().ok(),
                "in_port" => flow.in_port = Some(value.trim_matches('"').to_string()),
                "dl_vlan" => flow.dl_vlan = value.parse().ok(),
                _ => {}
            }
        }
        for action in actions.split(',') {
            if let Some(vid) = action.strip_prefix("mod_vlan_vid:") {
                flow.mod_vlan_vid = vid.parse().ok();
            }
        }
        Some(flow)
    }

    /// True for a VLAN translation flow `in_port,dl_vlan -> mod_vlan_vid`.
    /// `in_port` matches either the port number or its name.
    pub fn is_vlan_translation(&self, port_no: u32, port_name: &str, from: u16, to: u16) -> bool {
        let port_matches = self
            .in_port
            .as_deref()
            .is_some_and(|p| p == port_no.to_string() || p == port_name);
        port_matches && self.dl_vlan == Some(from) && self.mod_vlan_vid == Some(to)
    }
}

/// Parses the full `dump-flows` output.
pub fn parse_dump_flows(output: &str) -> Vec<DumpedFlow> {
    output.lines().filter_map(DumpedFlow::parse).collect()
}

/// Returns true if any dumped flow translates `from` to `to` on the port.
pub fn vlan_flow_present(flows: &[DumpedFlow], port_no: u32, port_name: &str, from: u16, to: u16) -> bool {
    flows
        .iter()
        .any(|f| f.is_vlan_translation(port_no, port_name, from, to))
}

/// Switch bridge/port/flow primitives
#[derive(Clone)]
pub struct OvsCtl {
    exec: Arc<dyn CommandExecutor>,
    vsctl: String,
    ofctl: String,
    ip: String,
}

impl std::fmt::Debug for OvsCtl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvsCtl")
            .field("vsctl", &self.vsctl)
            .field("ofctl", &self.ofctl)
            .field("ip", &self.ip)
            .finish()
    }
}

impl OvsCtl {
    pub fn new(exec: Arc<dyn CommandExecutor>, tools: &AgentToolsConfig) -> Self {
        Self {
            exec,
            vsctl: tools.ovs_vsctl.clone(),
            ofctl: tools.ovs_ofctl.clone(),
            ip: tools.ip.clone(),
        }
    }

    async fn run(&self, argv: Vec<String>) -> AgentResult<String> {
        self.exec.execute(&argv, true).await
    }

    /// Checks whether a bridge exists.
    pub async fn bridge_exists(&self, bridge: &str) -> AgentResult<bool> {
        match self.run(build_br_exists_cmd(&self.vsctl, bridge)).await {
            Ok(_) => Ok(true),
            Err(e) if e.exit_code() == Some(BR_ABSENT_EXIT_CODE) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Adds a port to a bridge; an existing membership is kept.
    pub async fn add_port(&self, bridge: &str, port: &str) -> AgentResult<()> {
        self.run(build_add_port_cmd(&self.vsctl, bridge, port)).await?;
        info!(bridge = %bridge, port = %port, "Added port");
        Ok(())
    }

    /// Removes a port from a bridge if present.
    pub async fn del_port(&self, bridge: &str, port: &str) -> AgentResult<()> {
        self.run(build_del_port_cmd(&self.vsctl, bridge, port)).await?;
        info!(bridge = %bridge, port = %port, "Removed port");
        Ok(())
    }

    /// Bridge owning a port, `None` if the port is unknown to OVS.
    pub async fn port_to_br(&self, port: &str) -> AgentResult<Option<String>> {
        match self.run(build_port_to_br_cmd(&self.vsctl, port)).await {
            Ok(out) => {
                let br = out.trim();
                Ok((!br.is_empty()).then(|| br.to_string()))
            }
            Err(AgentError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads one Interface column with surrounding quotes removed.
    pub async fn iface_column(&self, iface: &str, column: &str) -> AgentResult<String> {
        let out = self
            .run(build_get_iface_cmd(&self.vsctl, iface, column))
            .await?;
        Ok(out.trim().trim_matches('"').to_string())
    }

    /// Datapath port number of an interface.
    pub async fn ofport(&self, iface: &str) -> AgentResult<u32> {
        let raw = self.iface_column(iface, "ofport").await?;
        raw.parse::<i64>()
            .ok()
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| AgentError::port_not_found(iface, format!("ofport '{}'", raw)))
    }

    /// Local VLAN tag of the integration-bridge port carrying a VM port id.
    pub async fn lvid_for_port_id(&self, port_id: &str) -> AgentResult<Option<u16>> {
        let out = self
            .run(build_find_iface_by_id_cmd(&self.vsctl, port_id))
            .await?;
        let Some(iface) = out.lines().map(str::trim).find(|l| !l.is_empty()) else {
            debug!(port_id = %port_id, "No interface carries port id");
            return Ok(None);
        };
        let tag = self
            .run(build_get_port_tag_cmd(&self.vsctl, iface))
            .await?;
        Ok(tag.trim().parse::<u16>().ok())
    }

    pub async fn add_flow(&self, bridge: &str, flow: &str) -> AgentResult<()> {
        self.run(build_add_flow_cmd(&self.ofctl, bridge, flow)).await?;
        debug!(bridge = %bridge, flow = %flow, "Added flow");
        Ok(())
    }

    pub async fn del_flows(&self, bridge: &str, flow_match: &str) -> AgentResult<()> {
        self.run(build_del_flows_cmd(&self.ofctl, bridge, flow_match))
            .await?;
        debug!(bridge = %bridge, flow_match = %flow_match, "Deleted flows");
        Ok(())
    }

    pub async fn dump_flows(&self, bridge: &str) -> AgentResult<Vec<DumpedFlow>> {
        let out = self.run(build_dump_flows_cmd(&self.ofctl, bridge)).await?;
        Ok(parse_dump_flows(&out))
    }

    /// Checks whether a network device exists.
    pub async fn link_exists(&self, dev: &str) -> AgentResult<bool> {
        match self.run(build_link_show_cmd(&self.ip, dev)).await {
            Ok(_) => Ok(true),
            Err(AgentError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Creates a veth pair.
    pub async fn create_veth(&self, name: &str, peer: &str) -> AgentResult<()> {
        self.run(build_add_veth_cmd(&self.ip, name, peer)).await?;
        info!(name = %name, peer = %peer, "Created veth pair");
        Ok(())
    }

    pub async fn link_up(&self, dev: &str) -> AgentResult<()> {
        self.run(build_link_up_cmd(&self.ip, dev)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdp_agent_test::{FakeHost, ScriptedExecutor, BR_EX, BR_INT};

    fn ovs_on(exec: Arc<dyn CommandExecutor>) -> OvsCtl {
        OvsCtl::new(exec, &AgentToolsConfig::default())
    }

    #[test]
    fn test_parse_dump_line() {
        let line = " cookie=0x0, duration=4.2s, table=0, n_packets=3, n_bytes=180, \
                    priority=4,in_port=2,dl_vlan=10 actions=mod_vlan_vid:3003,NORMAL";
        let flow = DumpedFlow::parse(line).unwrap();
        assert_eq!(flow.priority, Some(4));
        assert_eq!(flow.in_port.as_deref(), Some("2"));
        assert_eq!(flow.dl_vlan, Some(10));
        assert_eq!(flow.mod_vlan_vid, Some(3003));
        assert!(flow.is_vlan_translation(2, "phy-br-ethd", 10, 3003));
        assert!(!flow.is_vlan_translation(2, "phy-br-ethd", 10, 3010));
    }

    #[test]
    fn test_parse_dump_named_port() {
        let out = "NXST_FLOW reply (xid=0x4):\n \
                   cookie=0x0, table=0, priority=3,in_port=\"int-br-ethd\",dl_vlan=3003 actions=mod_vlan_vid:10,NORMAL\n \
                   cookie=0x0, table=0, priority=0 actions=NORMAL\n";
        let flows = parse_dump_flows(out);
        assert_eq!(flows.len(), 2);
        assert!(vlan_flow_present(&flows, 7, "int-br-ethd", 3003, 10));
        assert!(!vlan_flow_present(&flows, 7, "int-br-ethd", 10, 3003));
    }

    #[tokio::test]
    async fn test_bridge_exists() {
        let host = Arc::new(FakeHost::standard());
        let ovs = ovs_on(host.clone());
        assert!(ovs.bridge_exists(BR_INT).await.unwrap());
        assert!(ovs.bridge_exists(BR_EX).await.unwrap());
        assert!(!ovs.bridge_exists("br-missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_bridge_exists_other_failure() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("br-exists", 1);
        let ovs = ovs_on(exec);
        assert!(ovs.bridge_exists(BR_INT).await.is_err());
    }

    #[tokio::test]
    async fn test_ports_and_ofport() {
        let host = Arc::new(FakeHost::standard());
        let ovs = ovs_on(host.clone());

        ovs.add_port(BR_EX, "eth2").await.unwrap();
        assert_eq!(ovs.port_to_br("eth2").await.unwrap().as_deref(), Some(BR_EX));
        assert!(ovs.ofport("eth2").await.unwrap() > 0);

        ovs.del_port(BR_EX, "eth2").await.unwrap();
        assert_eq!(ovs.port_to_br("eth2").await.unwrap(), None);
        assert!(matches!(
            ovs.ofport("eth2").await,
            Err(AgentError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_ofport_unassigned() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.respond("ofport", "-1");
        let ovs = ovs_on(exec);
        assert!(matches!(
            ovs.ofport("vdpo-eth2").await,
            Err(AgentError::PortNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lvid_lookup() {
        let host = Arc::new(FakeHost::standard());
        host.add_vm_port("p1", "tap-p1", 10);
        let ovs = ovs_on(host.clone());
        assert_eq!(ovs.lvid_for_port_id("p1").await.unwrap(), Some(10));
        assert_eq!(ovs.lvid_for_port_id("p-unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flow_roundtrip_through_dump() {
        let host = Arc::new(FakeHost::standard());
        let ovs = ovs_on(host.clone());

        ovs.add_flow(BR_EX, &outbound_flow(2, 10, 3003)).await.unwrap();
        let flows = ovs.dump_flows(BR_EX).await.unwrap();
        assert!(vlan_flow_present(&flows, 2, "phy-br-ethd", 10, 3003));

        ovs.del_flows(BR_EX, &outbound_flow_match(2, 10)).await.unwrap();
        let flows = ovs.dump_flows(BR_EX).await.unwrap();
        assert!(!vlan_flow_present(&flows, 2, "phy-br-ethd", 10, 3003));
    }

    #[tokio::test]
    async fn test_links() {
        let host = Arc::new(FakeHost::standard());
        let ovs = ovs_on(host.clone());
        assert!(!ovs.link_exists("vdpo-eth2").await.unwrap());
        ovs.create_veth("vdpo-eth2", "vdpl-eth2").await.unwrap();
        assert!(ovs.link_exists("vdpo-eth2").await.unwrap());
        assert!(ovs.link_exists("vdpl-eth2").await.unwrap());
        ovs.link_up("vdpl-eth2").await.unwrap();
    }
}
