//! Command builders for OVS, iproute2 and lldptool operations
//!
//! Every builder returns an argument vector; the tool path comes first and
//! is taken from the agent configuration.

/// LLDP ethertype
pub const LLDP_ETHERTYPE: u16 = 0x88cc;

/// VDP 2.2 (ECP) ethertype
pub const VDP22_ETHERTYPE: u16 = 0x8940;

/// Ethertypes steered between the uplink and the protocol veth
pub const PROTOCOL_ETHERTYPES: [u16; 2] = [LLDP_ETHERTYPE, VDP22_ETHERTYPE];

/// Priority of the protocol steering flows
pub const PROTOCOL_FLOW_PRIORITY: u16 = 50000;

/// Priority of the outbound (local -> provider) VLAN flow
pub const OUTBOUND_FLOW_PRIORITY: u16 = 4;

/// Priority of the inbound (provider -> local) VLAN flow
pub const INBOUND_FLOW_PRIORITY: u16 = 3;

/// Interconnect port name prefix on the integration bridge
pub const INT_PEER_PREFIX: &str = "int-";

/// Interconnect port name prefix on the uplink bridge
pub const PHY_PEER_PREFIX: &str = "phy-";

/// Protocol veth end plugged into OVS
pub const OVS_VETH_PREFIX: &str = "vdpo-";

/// Protocol veth end lldpad listens on
pub const LOCAL_VETH_PREFIX: &str = "vdpl-";

/// Linux interface name limit (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// lldptool agent group for the nearest customer bridge
pub const LLDP_NCB_GROUP: &str = "ncb";

fn ifname(prefix: &str, base: &str) -> String {
    let mut name = format!("{}{}", prefix, base);
    name.truncate(MAX_IFNAME_LEN);
    name
}

/// Names of the protocol veth pair for an uplink: (OVS side, lldpad side)
pub fn veth_names(uplink: &str) -> (String, String) {
    (ifname(OVS_VETH_PREFIX, uplink), ifname(LOCAL_VETH_PREFIX, uplink))
}

/// Interconnect port on the integration bridge
pub fn int_peer_name(br_ex: &str) -> String {
    ifname(INT_PEER_PREFIX, br_ex)
}

/// Interconnect port on the uplink bridge
pub fn phy_peer_name(br_ex: &str) -> String {
    ifname(PHY_PEER_PREFIX, br_ex)
}

fn cmd(tool: &str, args: &[&str]) -> Vec<String> {
    std::iter::once(tool)
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}

// ---- ovs-vsctl ----

/// Build bridge existence check (exit 2 when absent)
pub fn build_br_exists_cmd(vsctl: &str, bridge: &str) -> Vec<String> {
    cmd(vsctl, &["br-exists", bridge])
}

/// Build idempotent add-port command
pub fn build_add_port_cmd(vsctl: &str, bridge: &str, port: &str) -> Vec<String> {
    cmd(vsctl, &["--may-exist", "add-port", bridge, port])
}

/// Build idempotent del-port command
pub fn build_del_port_cmd(vsctl: &str, bridge: &str, port: &str) -> Vec<String> {
    cmd(vsctl, &["--if-exists", "del-port", bridge, port])
}

/// Build the bridge-of-port lookup
pub fn build_port_to_br_cmd(vsctl: &str, port: &str) -> Vec<String> {
    cmd(vsctl, &["port-to-br", port])
}

/// Build a single Interface column read
pub fn build_get_iface_cmd(vsctl: &str, iface: &str, column: &str) -> Vec<String> {
    cmd(vsctl, &["get", "Interface", iface, column])
}

/// Build the interface lookup by Neutron port id
pub fn build_find_iface_by_id_cmd(vsctl: &str, port_id: &str) -> Vec<String> {
    let selector = format!("external_ids:iface-id={}", port_id);
    cmd(
        vsctl,
        &["--bare", "--columns=name", "find", "Interface", &selector],
    )
}

/// Build local VLAN tag read for a port
pub fn build_get_port_tag_cmd(vsctl: &str, port: &str) -> Vec<String> {
    cmd(vsctl, &["get", "Port", port, "tag"])
}

// ---- ovs-ofctl ----

/// Build add-flow command
pub fn build_add_flow_cmd(ofctl: &str, bridge: &str, flow: &str) -> Vec<String> {
    cmd(ofctl, &["add-flow", bridge, flow])
}

/// Build del-flows command for a match
pub fn build_del_flows_cmd(ofctl: &str, bridge: &str, flow_match: &str) -> Vec<String> {
    cmd(ofctl, &["del-flows", bridge, flow_match])
}

/// Build table 0 dump command
pub fn build_dump_flows_cmd(ofctl: &str, bridge: &str) -> Vec<String> {
    cmd(ofctl, &["dump-flows", bridge, "table=0"])
}

// ---- flow specs ----

/// Protocol steering flow for one ethertype and direction
pub fn protocol_flow(in_port: u32, out_port: u32, ethertype: u16) -> String {
    format!(
        "priority={},in_port={},dl_type={:#06x},actions=output:{}",
        PROTOCOL_FLOW_PRIORITY, in_port, ethertype, out_port
    )
}

/// Match removing every protocol steering flow of one ethertype
pub fn protocol_flow_match(ethertype: u16) -> String {
    format!("dl_type={:#06x}", ethertype)
}

/// Outbound flow on the uplink bridge: local VLAN -> provider VLAN
pub fn outbound_flow(phy_peer_port: u32, lvid: u16, vdp_vlan: u16) -> String {
    format!(
        "priority={},in_port={},dl_vlan={},actions=mod_vlan_vid:{},NORMAL",
        OUTBOUND_FLOW_PRIORITY, phy_peer_port, lvid, vdp_vlan
    )
}

/// Match of the outbound flow of a local VLAN
pub fn outbound_flow_match(phy_peer_port: u32, lvid: u16) -> String {
    format!("in_port={},dl_vlan={}", phy_peer_port, lvid)
}

/// Inbound flow on the integration bridge: provider VLAN -> local VLAN
pub fn inbound_flow(int_peer_port: u32, vdp_vlan: u16, lvid: u16) -> String {
    format!(
        "priority={},in_port={},dl_vlan={},actions=mod_vlan_vid:{},NORMAL",
        INBOUND_FLOW_PRIORITY, int_peer_port, vdp_vlan, lvid
    )
}

/// Match of the inbound flow of a provider VLAN
pub fn inbound_flow_match(int_peer_port: u32, vdp_vlan: u16) -> String {
    format!("in_port={},dl_vlan={}", int_peer_port, vdp_vlan)
}

// ---- ip ----

/// Build link existence check
pub fn build_link_show_cmd(ip: &str, dev: &str) -> Vec<String> {
    cmd(ip, &["link", "show", "dev", dev])
}

/// Build veth pair creation
pub fn build_add_veth_cmd(ip: &str, name: &str, peer: &str) -> Vec<String> {
    cmd(ip, &["link", "add", name, "type", "veth", "peer", "name", peer])
}

/// Build link up
pub fn build_link_up_cmd(ip: &str, dev: &str) -> Vec<String> {
    cmd(ip, &["link", "set", "dev", dev, "up"])
}

// ---- lldptool ----

/// Build LLDP admin status enable
pub fn build_lldp_admin_cmd(lldptool: &str, iface: &str) -> Vec<String> {
    cmd(
        lldptool,
        &["-L", "-i", iface, "-g", LLDP_NCB_GROUP, "adminStatus=rxtx"],
    )
}

/// Build EVB TLV transmit enable
pub fn build_evb_enable_cmd(lldptool: &str, iface: &str) -> Vec<String> {
    cmd(
        lldptool,
        &["-T", "-i", iface, "-g", LLDP_NCB_GROUP, "-V", "evb", "-c", "enableTx=yes"],
    )
}

/// Build EVB group id capability enable
pub fn build_evb_gpid_cmd(lldptool: &str, iface: &str) -> Vec<String> {
    cmd(
        lldptool,
        &["-T", "-i", iface, "-g", LLDP_NCB_GROUP, "-V", "evb", "-c", "evbgpid=yes"],
    )
}

/// Build VDP module transmit enable
pub fn build_vdp_enable_cmd(lldptool: &str, iface: &str) -> Vec<String> {
    cmd(lldptool, &["-T", "-i", iface, "-V", "vdp", "-c", "enableTx=yes"])
}

/// Build a VDP request; every keyword becomes one `-c` argument
pub fn build_vdp_cmd(lldptool: &str, iface: &str, wait_reply: bool, keywords: &[String]) -> Vec<String> {
    let mut argv = cmd(lldptool, &["-T", "-i", iface]);
    if wait_reply {
        argv.push("-W".to_string());
    }
    argv.push("-V".to_string());
    argv.push("vdp".to_string());
    for kw in keywords {
        argv.push("-c".to_string());
        argv.push(kw.clone());
    }
    argv
}
