//! Per-network VLAN bookkeeping

use std::collections::{BTreeMap, HashMap};

/// Provider VLAN and failure reason recorded for one port
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortVlan {
    pub vlan: Option<u16>,
    pub fail_reason: Option<String>,
}

/// State of one network on one uplink bridge.
///
/// `late_binding_vlan` is the provider VLAN installed in the flow pair;
/// `vdp_nego_req` marks it as untrusted until the next negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVlan {
    pub lvid: u16,
    pub late_binding_vlan: Option<u16>,
    pub vdp_nego_req: bool,
    ports: HashMap<String, PortVlan>,
    vlan_refs: BTreeMap<u16, usize>,
}

impl LocalVlan {
    pub fn new(lvid: u16) -> Self {
        Self {
            lvid,
            late_binding_vlan: None,
            vdp_nego_req: false,
            ports: HashMap::new(),
            vlan_refs: BTreeMap::new(),
        }
    }

    fn release(&mut self, vlan: Option<u16>) {
        let Some(vlan) = vlan else { return };
        if let Some(count) = self.vlan_refs.get_mut(&vlan) {
            *count -= 1;
            if *count == 0 {
                self.vlan_refs.remove(&vlan);
            }
        }
    }

    /// Records (or replaces) the VLAN held by a port.
    pub fn set_port_vlan(&mut self, port_id: &str, vlan: Option<u16>, fail_reason: Option<String>) {
        let old = self
            .ports
            .insert(port_id.to_string(), PortVlan { vlan, fail_reason });
        self.release(old.and_then(|p| p.vlan));
        if let Some(vlan) = vlan {
            *self.vlan_refs.entry(vlan).or_insert(0) += 1;
        }
    }

    /// Forgets a port, returning what it held.
    pub fn remove_port(&mut self, port_id: &str) -> Option<PortVlan> {
        let removed = self.ports.remove(port_id)?;
        self.release(removed.vlan);
        Some(removed)
    }

    pub fn port_vlan(&self, port_id: &str) -> Option<&PortVlan> {
        self.ports.get(port_id)
    }

    pub fn has_port(&self, port_id: &str) -> bool {
        self.ports.contains_key(port_id)
    }

    pub fn port_ids(&self) -> impl Iterator<Item = &str> {
        self.ports.keys().map(String::as_str)
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn vlan_ref_count(&self, vlan: u16) -> usize {
        self.vlan_refs.get(&vlan).copied().unwrap_or(0)
    }

    /// Lowest VLAN held by any port.
    pub fn any_valid_vlan(&self) -> Option<u16> {
        self.vlan_refs.keys().next().copied()
    }

    /// Lowest held VLAN different from `except`.
    pub fn other_valid_vlan(&self, except: Option<u16>) -> Option<u16> {
        self.vlan_refs
            .keys()
            .copied()
            .find(|v| Some(*v) != except)
    }

    /// True when late binding can be reused without negotiation.
    pub fn is_settled(&self) -> bool {
        self.late_binding_vlan.is_some() && !self.vdp_nego_req
    }

    #[cfg(test)]
    fn refcounts_consistent(&self) -> bool {
        let mut counted: BTreeMap<u16, usize> = BTreeMap::new();
        for vlan in self.ports.values().filter_map(|p| p.vlan) {
            *counted.entry(vlan).or_insert(0) += 1;
        }
        counted == self.vlan_refs
    }
}
