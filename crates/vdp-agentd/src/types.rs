//! Type definitions for the VDP uplink agent

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use vdp_agent_common::{AgentError, AgentResult, VmResult};

/// Queue priority of uplink messages (lower is served first).
pub const UPLINK_MSG_PRIORITY: u32 = 10;

/// Queue priority of VM port messages.
pub const VM_MSG_PRIORITY: u32 = 50;

/// Largest segmentation id (24-bit VNI space).
pub const MAX_SEGMENTATION_ID: u32 = 0x00ff_ffff;

/// Highest usable 802.1Q VLAN id.
pub const MAX_VLAN_ID: u16 = 4094;

/// Fail reason reported while no uplink has been discovered.
pub const UPLINK_UNDISCOVERED_REASON: &str = "uplink not discovered by LLDP";

/// Returns true if `vlan` is a usable 802.1Q VLAN id.
pub fn is_valid_vlan(vlan: u16) -> bool {
    (1..=MAX_VLAN_ID).contains(&vlan)
}

/// Desired state of a VM port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortStatus {
    /// Port is being plugged
    Up,
    /// Port is being unplugged
    Down,
}

impl FromStr for PortStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(PortStatus::Up),
            "down" => Ok(PortStatus::Down),
            other => Err(AgentError::invalid_message(
                "status",
                format!("unknown port status '{}'", other),
            )),
        }
    }
}

impl PortStatus {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Up => "up",
            PortStatus::Down => "down",
        }
    }
}

/// Desired state of the physical uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UplinkStatus {
    /// Uplink discovered, set up the bridge path
    Up,
    /// Uplink lost, tear the bridge path down
    Down,
}

impl UplinkStatus {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            UplinkStatus::Up => "up",
            UplinkStatus::Down => "down",
        }
    }
}

/// Vendor (OUI) sub-fields carried in a VDP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuiData {
    /// Vendor identifier understood by lldpad (e.g. "cisco")
    pub oui_id: String,
    /// Ordered key/value pairs
    pub fields: Vec<(String, String)>,
}

impl OuiData {
    /// Creates an empty OUI block for a vendor.
    pub fn new(oui_id: impl Into<String>) -> Self {
        Self {
            oui_id: oui_id.into(),
            fields: Vec::new(),
        }
    }

    /// Adds one field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Renders each field as an lldptool `oui=` argument.
    pub fn to_lldptool_args(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|(k, v)| format!("oui={},{}={}", self.oui_id, k, v))
            .collect()
    }
}

/// Normalizes a MAC address to lowercase colon form, rejecting anything else.
pub fn normalize_mac(mac: &str) -> AgentResult<String> {
    let parts: Vec<&str> = mac.split(':').collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(mac.to_ascii_lowercase())
    } else {
        Err(AgentError::invalid_message(
            "mac",
            format!("'{}' is not a MAC address", mac),
        ))
    }
}

/// VM port plug/unplug request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEvent {
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    pub segmentation_id: u32,
    pub status: PortStatus,
    pub oui: Option<OuiData>,
    /// Uplink bound when the request was accepted
    pub phy_uplink: Option<String>,
}

impl VmEvent {
    /// Builds a validated VM event.
    pub fn new(
        port_id: impl Into<String>,
        mac: &str,
        net_id: impl Into<String>,
        segmentation_id: u32,
        status: PortStatus,
        oui: Option<OuiData>,
        phy_uplink: Option<String>,
    ) -> AgentResult<Self> {
        let port_id = port_id.into();
        let net_id = net_id.into();
        if port_id.is_empty() {
            return Err(AgentError::invalid_message("port_id", "empty"));
        }
        if net_id.is_empty() {
            return Err(AgentError::invalid_message("net_id", "empty"));
        }
        if segmentation_id == 0 || segmentation_id > MAX_SEGMENTATION_ID {
            return Err(AgentError::invalid_message(
                "segmentation_id",
                format!("{} out of range", segmentation_id),
            ));
        }
        Ok(Self {
            port_id,
            mac: normalize_mac(mac)?,
            net_id,
            segmentation_id,
            status,
            oui,
            phy_uplink,
        })
    }
}

/// Uplink up/down request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkEvent {
    pub status: UplinkStatus,
    pub phy_uplink: String,
    pub br_int: String,
    pub br_ex: String,
}

impl UplinkEvent {
    /// Builds a validated uplink event.
    pub fn new(
        status: UplinkStatus,
        phy_uplink: impl Into<String>,
        br_int: impl Into<String>,
        br_ex: impl Into<String>,
    ) -> AgentResult<Self> {
        let ev = Self {
            status,
            phy_uplink: phy_uplink.into(),
            br_int: br_int.into(),
            br_ex: br_ex.into(),
        };
        for (field, value) in [
            ("phy_uplink", &ev.phy_uplink),
            ("br_int", &ev.br_int),
            ("br_ex", &ev.br_ex),
        ] {
            if value.is_empty() {
                return Err(AgentError::invalid_message(field, "empty"));
            }
        }
        Ok(ev)
    }
}

/// Message carried by the agent's event queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdpQueMsg {
    Vm(VmEvent),
    Uplink(UplinkEvent),
}

impl VdpQueMsg {
    /// Queue priority for this message.
    pub fn priority(&self) -> u32 {
        match self {
            VdpQueMsg::Vm(_) => VM_MSG_PRIORITY,
            VdpQueMsg::Uplink(_) => UPLINK_MSG_PRIORITY,
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            VdpQueMsg::Vm(vm) => format!("vm {} {}", vm.port_id, vm.status.as_str()),
            VdpQueMsg::Uplink(up) => format!("uplink {} {}", up.phy_uplink, up.status.as_str()),
        }
    }
}

/// Failure result matching a port status.
pub fn failure_result(status: PortStatus) -> VmResult {
    match status {
        PortStatus::Up => VmResult::CreateFailed,
        PortStatus::Down => VmResult::DeleteFailed,
    }
}
