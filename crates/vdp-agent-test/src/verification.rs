//! Verification helpers for agent scenarios
//!
//! Assertions over the simulated host's switch state, returned as errors so
//! scenario tests can report what was actually found.

use thiserror::Error;

use crate::fixtures::{BR_EX, BR_INT};
use crate::host::FakeHost;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Translation pair {lvid} <-> {vlan} not installed")]
    FlowPairMissing { lvid: u16, vlan: u16 },

    #[error("Translation pair {lvid} <-> {vlan} still installed")]
    FlowPairPresent { lvid: u16, vlan: u16 },

    #[error("Expected {expected} flows matching '{pattern}' on {bridge}, found {actual}")]
    FlowCountMismatch {
        bridge: String,
        pattern: String,
        expected: usize,
        actual: usize,
    },

    #[error("Port '{port}' on bridge {bridge}: expected present={expected}")]
    PortMembership {
        bridge: String,
        port: String,
        expected: bool,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Switch state verifier for the standard bridge pair
pub struct HostVerifier<'a> {
    host: &'a FakeHost,
}

impl<'a> HostVerifier<'a> {
    pub fn new(host: &'a FakeHost) -> Self {
        Self { host }
    }

    /// Both directions of `lvid <-> vlan` are installed.
    pub fn assert_flow_pair(&self, lvid: u16, vlan: u16) -> VerifyResult<()> {
        if self.host.vlan_flow_pair_installed(BR_INT, BR_EX, lvid, vlan) {
            Ok(())
        } else {
            Err(VerificationError::FlowPairMissing { lvid, vlan })
        }
    }

    pub fn assert_no_flow_pair(&self, lvid: u16, vlan: u16) -> VerifyResult<()> {
        if self.host.vlan_flow_pair_installed(BR_INT, BR_EX, lvid, vlan) {
            Err(VerificationError::FlowPairPresent { lvid, vlan })
        } else {
            Ok(())
        }
    }

    pub fn assert_flow_count(&self, bridge: &str, pattern: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.host.flows_matching(bridge, pattern).len();
        if actual == expected {
            Ok(())
        } else {
            Err(VerificationError::FlowCountMismatch {
                bridge: bridge.to_string(),
                pattern: pattern.to_string(),
                expected,
                actual,
            })
        }
    }

    /// No VLAN translation flow left on either bridge.
    pub fn assert_no_translation_flows(&self) -> VerifyResult<()> {
        self.assert_flow_count(BR_EX, "mod_vlan_vid", 0)?;
        self.assert_flow_count(BR_INT, "mod_vlan_vid", 0)
    }

    pub fn assert_port(&self, bridge: &str, port: &str, expected: bool) -> VerifyResult<()> {
        if self.host.port_on_bridge(bridge, port) == expected {
            Ok(())
        } else {
            Err(VerificationError::PortMembership {
                bridge: bridge.to_string(),
                port: port.to_string(),
                expected,
            })
        }
    }
}
