//! vdp-agentd - VDP/EVB uplink agent
//!
//! Discovers the physical uplink facing an 802.1Qbg switch, wires it into
//! Open vSwitch next to a protocol veth for lldpad, negotiates a provider
//! VLAN for every VM network through VDP and keeps the VLAN translation
//! flows between the integration bridge and the uplink bridge in sync with
//! what the switch granted.

pub mod commands;
pub mod config;
pub mod detect;
pub mod lldpad;
pub mod local_vlan;
pub mod ovs_lib;
pub mod ovs_vdp;
pub mod reply;
pub mod rpc;
pub mod types;
mod vdp_mgr;

pub use config::AgentConfig;
pub use detect::ScriptUplinkDetector;
pub use lldpad::{LldpadDriver, VlanCallbackData, VlanChangeHandler};
pub use local_vlan::LocalVlan;
pub use ovs_vdp::{OvsVdp, RestartEntry};
pub use rpc::LoggingOrchestrator;
pub use types::*;
pub use vdp_mgr::{UplinkState, VdpMgr};
