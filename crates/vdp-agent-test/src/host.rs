//! Simulated host for agent tests
//!
//! [`FakeHost`] keeps OVS bridges, ports, flows, links and the switch's VDP
//! answers in memory and implements [`CommandExecutor`], so the agent runs
//! its real command lines against it. Every command is recorded as rendered
//! by [`render_command`], which is also what failure patterns match against.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::trace;

use vdp_agent_common::shell::render_command;
use vdp_agent_common::{AgentError, AgentResult, CommandExecutor};

use crate::fixtures::{BR_EX, BR_INT, UPLINK};

/// Layout of lldptool VDP replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFormat {
    /// One `key = value` pair per line
    #[default]
    Current,
    /// A single comma separated line
    Legacy,
}

#[derive(Debug, Clone)]
struct FailRule {
    pattern: String,
    exit_code: i32,
    once: bool,
}

fn command_failed(command: &str, exit_code: i32, output: impl Into<String>) -> AgentError {
    AgentError::CommandFailed {
        command: command.to_string(),
        exit_code,
        output: output.into(),
    }
}

/// One OpenFlow rule as installed by `ovs-ofctl add-flow`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Flow {
    matches: Vec<String>,
    actions: String,
}

impl Flow {
    fn parse(text: &str) -> Self {
        let (matches, actions) = match text.find("actions=") {
            Some(pos) => (&text[..pos], &text[pos + "actions=".len()..]),
            None => (text, ""),
        };
        Self {
            matches: matches
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            actions: actions.trim().to_string(),
        }
    }

    fn text(&self) -> String {
        let mut text = self.matches.join(",");
        if !text.is_empty() {
            text.push(',');
        }
        text.push_str("actions=");
        text.push_str(&self.actions);
        text
    }

    fn same_match(&self, other: &Flow) -> bool {
        let mut a = self.matches.clone();
        let mut b = other.matches.clone();
        a.sort();
        b.sort();
        a == b
    }

    /// Non-strict del-flows semantics: every given field must be present.
    fn covered_by(&self, fields: &[String]) -> bool {
        fields.iter().all(|f| self.matches.contains(f))
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.matches
            .iter()
            .filter_map(|f| f.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    fn translates(&self, in_port: u32, from: u16, to: u16) -> bool {
        let rewrite = format!("mod_vlan_vid:{}", to);
        self.field("in_port") == Some(in_port.to_string().as_str())
            && self.field("dl_vlan") == Some(from.to_string().as_str())
            && self.actions.split(',').any(|a| a == rewrite)
    }

    fn dump_line(&self) -> String {
        format!(
            " cookie=0x0, duration=1.0s, table=0, n_packets=0, n_bytes=0, {} actions={}",
            self.matches.join(","),
            self.actions
        )
    }
}

/// VLAN grant token of a VDP filter replaced by `vlan`.
fn filter_with_vlan(filter: &str, vlan: u16) -> String {
    match filter.split_once('-') {
        Some((_, rest)) => format!("{}-{}", vlan, rest),
        None => vlan.to_string(),
    }
}

/// Group id carried by a VDP filter, 0 for formats without one.
fn filter_gid(filter: &str) -> u32 {
    let tokens: Vec<&str> = filter.split('-').collect();
    match tokens.as_slice() {
        [_, .., last] if !last.contains(':') => last.parse().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Debug, Default)]
struct HostState {
    bridges: BTreeMap<String, BTreeSet<String>>,
    ofports: HashMap<String, u32>,
    next_ofport: u32,
    links: BTreeSet<String>,
    iface_ids: HashMap<String, String>,
    tags: HashMap<String, u16>,
    flows: HashMap<String, Vec<Flow>>,
    switch_vlans: HashMap<u32, Option<u16>>,
    associations: HashMap<String, String>,
    reply_format: ReplyFormat,
    fail_rules: Vec<FailRule>,
    commands: Vec<String>,
}

impl HostState {
    fn attach_port(&mut self, bridge: &str, port: &str) -> bool {
        match self.bridges.get_mut(bridge) {
            Some(ports) => {
                ports.insert(port.to_string());
            }
            None => return false,
        }
        if !self.ofports.contains_key(port) {
            self.next_ofport += 1;
            self.ofports.insert(port.to_string(), self.next_ofport);
        }
        true
    }

    fn bridge_of(&self, port: &str) -> Option<&str> {
        self.bridges
            .iter()
            .find(|(_, ports)| ports.contains(port))
            .map(|(br, _)| br.as_str())
    }

    fn injected_failure(&mut self, rendered: &str) -> Option<AgentError> {
        let pos = self
            .fail_rules
            .iter()
            .position(|r| rendered.contains(&r.pattern))?;
        let rule = if self.fail_rules[pos].once {
            self.fail_rules.remove(pos)
        } else {
            self.fail_rules[pos].clone()
        };
        Some(command_failed(rendered, rule.exit_code, "injected failure"))
    }

    fn vsctl(&mut self, cmd: &str, args: &[&str]) -> AgentResult<String> {
        let args: Vec<&str> = args
            .iter()
            .copied()
            .filter(|a| !a.starts_with("--"))
            .collect();
        match args.as_slice() {
            ["br-exists", br] => {
                if self.bridges.contains_key(*br) {
                    Ok(String::new())
                } else {
                    Err(command_failed(cmd, 2, ""))
                }
            }
            ["list-br"] => Ok(self.bridges.keys().cloned().collect::<Vec<_>>().join("\n")),
            ["add-port", br, port] => {
                if self.attach_port(br, port) {
                    Ok(String::new())
                } else {
                    Err(command_failed(cmd, 1, format!("no bridge named {}", br)))
                }
            }
            ["del-port", br, port] => {
                if let Some(ports) = self.bridges.get_mut(*br) {
                    if ports.remove(*port) {
                        self.ofports.remove(*port);
                    }
                }
                Ok(String::new())
            }
            ["port-to-br", port] => self
                .bridge_of(port)
                .map(str::to_string)
                .ok_or_else(|| command_failed(cmd, 1, format!("no port named {}", port))),
            ["get", "Interface", iface, "ofport"] => self
                .ofports
                .get(*iface)
                .map(|n| n.to_string())
                .ok_or_else(|| {
                    command_failed(cmd, 1, format!("no row \"{}\" in table Interface", iface))
                }),
            ["get", "Port", port, "tag"] => {
                if self.bridge_of(port).is_none() {
                    return Err(command_failed(
                        cmd,
                        1,
                        format!("no row \"{}\" in table Port", port),
                    ));
                }
                Ok(self
                    .tags
                    .get(*port)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "[]".to_string()))
            }
            ["find", "Interface", selector] => {
                let iface = selector
                    .strip_prefix("external_ids:iface-id=")
                    .and_then(|id| self.iface_ids.get(id));
                Ok(iface.cloned().unwrap_or_default())
            }
            _ => Err(command_failed(cmd, 1, "unsupported ovs-vsctl command")),
        }
    }

    fn ofctl(&mut self, cmd: &str, args: &[&str]) -> AgentResult<String> {
        let bridge = args.get(1).copied().unwrap_or_default();
        if !self.bridges.contains_key(bridge) {
            return Err(command_failed(
                cmd,
                1,
                format!("{} is not a bridge or a socket", bridge),
            ));
        }
        let flows = self.flows.entry(bridge.to_string()).or_default();
        match args {
            ["add-flow", _, text] => {
                let flow = Flow::parse(text);
                flows.retain(|f| !f.same_match(&flow));
                flows.push(flow);
                Ok(String::new())
            }
            ["del-flows", _, text] => {
                let fields = Flow::parse(text).matches;
                flows.retain(|f| !f.covered_by(&fields));
                Ok(String::new())
            }
            ["del-flows", _] => {
                flows.clear();
                Ok(String::new())
            }
            ["dump-flows", _, ..] => {
                let mut out = vec!["NXST_FLOW reply (xid=0x4):".to_string()];
                out.extend(flows.iter().map(Flow::dump_line));
                Ok(out.join("\n"))
            }
            _ => Err(command_failed(cmd, 1, "unsupported ovs-ofctl command")),
        }
    }

    fn ip(&mut self, cmd: &str, args: &[&str]) -> AgentResult<String> {
        match args {
            ["link", "show", "dev", dev] | ["link", "show", dev] => {
                if self.links.contains(*dev) {
                    Ok(format!("7: {}: <BROADCAST,MULTICAST,UP> mtu 1500", dev))
                } else {
                    Err(command_failed(
                        cmd,
                        1,
                        format!("Device \"{}\" does not exist.", dev),
                    ))
                }
            }
            ["link", "add", name, "type", "veth", "peer", "name", peer] => {
                if self.links.contains(*name) || self.links.contains(*peer) {
                    return Err(command_failed(cmd, 2, "RTNETLINK answers: File exists"));
                }
                self.links.insert(name.to_string());
                self.links.insert(peer.to_string());
                Ok(String::new())
            }
            ["link", "set", "dev", dev, "up"] => {
                if self.links.contains(*dev) {
                    Ok(String::new())
                } else {
                    Err(command_failed(cmd, 1, "Cannot find device"))
                }
            }
            ["link", "del", dev] | ["link", "delete", dev] => {
                self.links.remove(*dev);
                Ok(String::new())
            }
            _ => Err(command_failed(cmd, 1, "unsupported ip command")),
        }
    }

    fn vdp_reply(&self, keywords: &[(&str, &str)], mode: &str, filter: &str) -> String {
        let mut fields = vec![("mode", mode.to_string())];
        for key in ["mgrid2", "typeid", "typeidver", "uuid", "hints"] {
            if let Some((_, v)) = keywords.iter().find(|(k, _)| *k == key) {
                fields.push((key, v.to_string()));
            }
        }
        fields.push(("filter", filter.to_string()));

        match self.reply_format {
            ReplyFormat::Current => fields
                .iter()
                .map(|(k, v)| format!("{} = {}", k, v))
                .collect::<Vec<_>>()
                .join("\n"),
            ReplyFormat::Legacy => fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn lldptool(&mut self, cmd: &str, args: &[&str]) -> AgentResult<String> {
        let keywords: Vec<(&str, &str)> = args
            .windows(2)
            .filter(|w| w[0] == "-c")
            .filter_map(|w| w[1].split_once('='))
            .collect();
        let lookup = |key: &str| keywords.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

        // adminStatus / enableTx / evbgpid
        let Some(mode) = lookup("mode") else {
            return Ok(String::new());
        };
        let uuid = lookup("uuid").ok_or_else(|| command_failed(cmd, 1, "missing uuid"))?;
        let filter = lookup("filter").unwrap_or("0");
        let wait = args.contains(&"-W");

        match mode {
            "assoc" => {
                let granted = self
                    .switch_vlans
                    .get(&filter_gid(filter))
                    .copied()
                    .flatten();
                let (mode, reply_filter) = match granted {
                    Some(vlan) => {
                        let f = filter_with_vlan(filter, vlan);
                        self.associations.insert(uuid.to_string(), f.clone());
                        ("assoc", f)
                    }
                    None => {
                        self.associations.remove(uuid);
                        ("deassoc", filter_with_vlan(filter, 0))
                    }
                };
                if wait {
                    Ok(self.vdp_reply(&keywords, mode, &reply_filter))
                } else {
                    Ok(String::new())
                }
            }
            _ => {
                self.associations.remove(uuid);
                Ok(String::new())
            }
        }
    }
}

/// In-memory host answering the agent's external tools.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// Empty host: no bridges, no links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Integration and uplink bridges joined by their interconnect pair,
    /// plus the physical uplink device.
    pub fn standard() -> Self {
        let host = Self::new();
        host.add_bridge(BR_INT);
        host.add_bridge(BR_EX);
        host.add_port(BR_INT, &format!("int-{}", BR_EX));
        host.add_port(BR_EX, &format!("phy-{}", BR_EX));
        host.add_link(UPLINK);
        host
    }

    pub fn add_bridge(&self, bridge: &str) {
        self.state
            .lock()
            .bridges
            .entry(bridge.to_string())
            .or_default();
    }

    /// Deletes a bridge with its ports and flows.
    pub fn remove_bridge(&self, bridge: &str) {
        let mut state = self.state.lock();
        if let Some(ports) = state.bridges.remove(bridge) {
            for port in ports {
                state.ofports.remove(&port);
            }
        }
        state.flows.remove(bridge);
    }

    /// Puts a port on an existing bridge and assigns it an ofport.
    pub fn add_port(&self, bridge: &str, port: &str) {
        self.state.lock().attach_port(bridge, port);
    }

    pub fn add_link(&self, dev: &str) {
        self.state.lock().links.insert(dev.to_string());
    }

    /// Plugs a VM interface into the integration bridge with its local VLAN.
    pub fn add_vm_port(&self, port_id: &str, iface: &str, tag: u16) {
        let mut state = self.state.lock();
        state.attach_port(BR_INT, iface);
        state.links.insert(iface.to_string());
        state
            .iface_ids
            .insert(port_id.to_string(), iface.to_string());
        state.tags.insert(iface.to_string(), tag);
    }

    /// VLAN the switch grants for a group id; `None` rejects.
    pub fn set_switch_vlan(&self, gid: u32, vlan: Option<u16>) {
        self.state.lock().switch_vlans.insert(gid, vlan);
    }

    pub fn set_reply_format(&self, format: ReplyFormat) {
        self.state.lock().reply_format = format;
    }

    /// Fails every command containing `pattern`.
    pub fn fail_always(&self, pattern: &str, exit_code: i32) {
        self.state.lock().fail_rules.push(FailRule {
            pattern: pattern.to_string(),
            exit_code,
            once: false,
        });
    }

    /// Fails the next command containing `pattern`.
    pub fn fail_once(&self, pattern: &str, exit_code: i32) {
        self.state.lock().fail_rules.push(FailRule {
            pattern: pattern.to_string(),
            exit_code,
            once: true,
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_rules.clear();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn has_command(&self, pattern: &str) -> bool {
        self.state
            .lock()
            .commands
            .iter()
            .any(|c| c.contains(pattern))
    }

    pub fn last_command_matching(&self, pattern: &str) -> Option<String> {
        self.state
            .lock()
            .commands
            .iter()
            .rev()
            .find(|c| c.contains(pattern))
            .cloned()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn port_on_bridge(&self, bridge: &str, port: &str) -> bool {
        self.state
            .lock()
            .bridges
            .get(bridge)
            .is_some_and(|ports| ports.contains(port))
    }

    pub fn ofport(&self, iface: &str) -> Option<u32> {
        self.state.lock().ofports.get(iface).copied()
    }

    pub fn link_exists(&self, dev: &str) -> bool {
        self.state.lock().links.contains(dev)
    }

    /// Installed flows of a bridge whose text contains `pattern`.
    pub fn flows_matching(&self, bridge: &str, pattern: &str) -> Vec<String> {
        self.state
            .lock()
            .flows
            .get(bridge)
            .map(|flows| {
                flows
                    .iter()
                    .map(Flow::text)
                    .filter(|s| s.contains(pattern))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops flows behind the agent's back.
    pub fn remove_flows(&self, bridge: &str, pattern: &str) {
        if let Some(flows) = self.state.lock().flows.get_mut(bridge) {
            flows.retain(|f| !f.text().contains(pattern));
        }
    }

    /// True when both translation directions for `lvid <-> vlan` exist:
    /// outbound on the uplink bridge, inbound on the integration bridge.
    pub fn vlan_flow_pair_installed(&self, br_int: &str, br_ex: &str, lvid: u16, vlan: u16) -> bool {
        let state = self.state.lock();
        let phy_peer = state.ofports.get(&format!("phy-{}", br_ex)).copied();
        let int_peer = state.ofports.get(&format!("int-{}", br_ex)).copied();
        let (Some(phy_peer), Some(int_peer)) = (phy_peer, int_peer) else {
            return false;
        };
        let has = |bridge: &str, port: u32, from: u16, to: u16| {
            state
                .flows
                .get(bridge)
                .is_some_and(|flows| flows.iter().any(|f| f.translates(port, from, to)))
        };
        has(br_ex, phy_peer, lvid, vlan) && has(br_int, int_peer, vlan, lvid)
    }

    /// Filter the switch currently holds for a VSI.
    pub fn switch_association(&self, port_id: &str) -> Option<String> {
        self.state.lock().associations.get(port_id).cloned()
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(&self, argv: &[String], _as_root: bool) -> AgentResult<String> {
        let rendered = render_command(argv);
        let mut state = self.state.lock();
        state.commands.push(rendered.clone());
        trace!(command = %rendered, "FakeHost executing");

        if let Some(err) = state.injected_failure(&rendered) {
            return Err(err);
        }

        let Some((program, args)) = argv.split_first() else {
            return Err(AgentError::internal("empty command"));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let tool = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        match tool {
            "ovs-vsctl" => state.vsctl(&rendered, &args),
            "ovs-ofctl" => state.ofctl(&rendered, &args),
            "ip" => state.ip(&rendered, &args),
            "lldptool" => state.lldptool(&rendered, &args),
            _ => Err(command_failed(&rendered, 127, "command not found")),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    answer: Result<String, i32>,
}

/// Executor answering from a list of `pattern -> output` rules.
///
/// Rules are tried in insertion order and the first one contained in the
/// rendered command wins. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            answer: Ok(output.to_string()),
        });
    }

    pub fn fail(&self, pattern: &str, exit_code: i32) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            answer: Err(exit_code),
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, argv: &[String], _as_root: bool) -> AgentResult<String> {
        let rendered = render_command(argv);
        self.commands.lock().push(rendered.clone());

        let answer = self
            .rules
            .lock()
            .iter()
            .find(|r| rendered.contains(&r.pattern))
            .map(|r| r.answer.clone())
            .unwrap_or_else(|| Ok(String::new()));
        answer.map_err(|code| command_failed(&rendered, code, "scripted failure"))
    }
}
