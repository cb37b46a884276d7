//! Test fixtures for agent scenarios
//!
//! Names and VM ports shared by unit and scenario tests.

use crate::host::FakeHost;

/// Integration bridge
pub const BR_INT: &str = "br-int";

/// Uplink bridge
pub const BR_EX: &str = "br-ethd";

/// Physical uplink of the standard host
pub const UPLINK: &str = "eth2";

/// Protocol veth, lldpad side, of [`UPLINK`]
pub const UPLINK_VETH: &str = "vdpl-eth2";

/// Network used by most scenarios
pub const NET1: &str = "net-1";

/// Segmentation id (VDP group id) of [`NET1`]
pub const SEG1: u32 = 100;

/// A VM port as the orchestrator and OVS see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPortFixture {
    pub port_id: String,
    pub mac: String,
    pub net_id: String,
    pub segmentation_id: u32,
    pub iface: String,
    pub lvid: u16,
}

impl VmPortFixture {
    /// Port `n` of [`NET1`] on local VLAN `lvid`.
    pub fn new(n: u8, lvid: u16) -> Self {
        Self {
            port_id: format!("0b7bd1a8-4ae1-4b13-9f12-{:012x}", n),
            mac: format!("fa:16:3e:00:00:{:02x}", n),
            net_id: NET1.to_string(),
            segmentation_id: SEG1,
            iface: format!("tap{}", n),
            lvid,
        }
    }

    /// Moves the port to another network.
    pub fn on_network(mut self, net_id: &str, segmentation_id: u32) -> Self {
        self.net_id = net_id.to_string();
        self.segmentation_id = segmentation_id;
        self
    }

    /// Plugs the port into the host's integration bridge.
    pub fn plug(&self, host: &FakeHost) -> &Self {
        host.add_vm_port(&self.port_id, &self.iface, self.lvid);
        self
    }
}
