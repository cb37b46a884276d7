//! Configuration file support for vdp-agentd
//!
//! Loads and validates the agent configuration from TOML files.
//! Default location: /etc/vdp-agent/vdp-agent.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use vdp_agent_common::{AgentError, AgentResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vdp-agent/vdp-agent.toml";

/// VSI id format: UUID.
pub const VSIID_FRMT_UUID: u8 = 5;

/// Filter format: VLAN only.
pub const FILTER_FRMT_VID: u8 = 1;
/// Filter format: VLAN and MAC.
pub const FILTER_FRMT_MACVID: u8 = 2;
/// Filter format: VLAN and group id.
pub const FILTER_FRMT_GIDVID: u8 = 3;
/// Filter format: VLAN, MAC and group id.
pub const FILTER_FRMT_GIDMACVID: u8 = 4;

/// OVS bridges the agent works on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Integration bridge the VM ports are plugged into
    #[serde(default = "default_integration_bridge")]
    pub integration_bridge: String,

    /// Uplink bridge holding the physical uplink
    #[serde(default = "default_external_bridge")]
    pub external_bridge: String,
}

/// Uplink discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Use a fixed uplink instead of LLDP discovery
    #[serde(default)]
    pub static_uplink: bool,

    /// Uplink port when `static_uplink` is set
    #[serde(default)]
    pub static_uplink_port: Option<String>,

    /// Consecutive "down" detections before a discovered uplink is dropped
    #[serde(default = "default_down_threshold")]
    pub down_threshold: u32,

    /// Detection period in seconds
    #[serde(default = "default_detect_interval")]
    pub detect_interval_secs: u64,

    /// Error queue drain period in seconds
    #[serde(default = "default_error_queue_interval")]
    pub error_queue_interval_secs: u64,

    /// Detection command; the protocol veth is appended when known
    #[serde(default = "default_detect_command")]
    pub detect_command: String,
}

/// VDP protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdpConfig {
    #[serde(default)]
    pub mgrid: u32,

    #[serde(default)]
    pub typeid: u32,

    #[serde(default)]
    pub typeid_ver: u32,

    #[serde(default = "default_vsiid_frmt")]
    pub vsiid_frmt: u8,

    #[serde(default = "default_filter_frmt")]
    pub filter_frmt: u8,

    /// Re-association period in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Flow consistency check period in seconds
    #[serde(default = "default_flow_check_interval")]
    pub flow_check_interval_secs: u64,
}

/// External tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToolsConfig {
    /// Privilege prefix, split on whitespace; empty disables it
    #[serde(default = "default_root_helper")]
    pub root_helper: String,

    #[serde(default = "default_lldptool")]
    pub lldptool: String,

    #[serde(default = "default_ovs_vsctl")]
    pub ovs_vsctl: String,

    #[serde(default = "default_ovs_ofctl")]
    pub ovs_ofctl: String,

    #[serde(default = "default_ip")]
    pub ip: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub bridges: BridgeConfig,

    #[serde(default)]
    pub uplink: UplinkConfig,

    #[serde(default)]
    pub vdp: VdpConfig,

    #[serde(default)]
    pub agent: AgentToolsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

// Default functions
fn default_integration_bridge() -> String {
    "br-int".to_string()
}

fn default_external_bridge() -> String {
    "br-ethd".to_string()
}

fn default_down_threshold() -> u32 {
    3
}

fn default_detect_interval() -> u64 {
    10
}

fn default_error_queue_interval() -> u64 {
    30
}

fn default_detect_command() -> String {
    "/usr/local/bin/vdp-uplink-detect".to_string()
}

fn default_vsiid_frmt() -> u8 {
    VSIID_FRMT_UUID
}

fn default_filter_frmt() -> u8 {
    FILTER_FRMT_GIDMACVID
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_flow_check_interval() -> u64 {
    60
}

fn default_root_helper() -> String {
    "sudo".to_string()
}

fn default_lldptool() -> String {
    "lldptool".to_string()
}

fn default_ovs_vsctl() -> String {
    "ovs-vsctl".to_string()
}

fn default_ovs_ofctl() -> String {
    "ovs-ofctl".to_string()
}

fn default_ip() -> String {
    "ip".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            integration_bridge: default_integration_bridge(),
            external_bridge: default_external_bridge(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            static_uplink: false,
            static_uplink_port: None,
            down_threshold: default_down_threshold(),
            detect_interval_secs: default_detect_interval(),
            error_queue_interval_secs: default_error_queue_interval(),
            detect_command: default_detect_command(),
        }
    }
}

impl Default for VdpConfig {
    fn default() -> Self {
        Self {
            mgrid: 0,
            typeid: 0,
            typeid_ver: 0,
            vsiid_frmt: default_vsiid_frmt(),
            filter_frmt: default_filter_frmt(),
            refresh_interval_secs: default_refresh_interval(),
            flow_check_interval_secs: default_flow_check_interval(),
        }
    }
}

impl Default for AgentToolsConfig {
    fn default() -> Self {
        Self {
            root_helper: default_root_helper(),
            lldptool: default_lldptool(),
            ovs_vsctl: default_ovs_vsctl(),
            ovs_ofctl: default_ovs_ofctl(),
            ip: default_ip(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AgentToolsConfig {
    /// Privilege prefix, `None` when disabled.
    pub fn root_helper(&self) -> Option<&str> {
        let helper = self.root_helper.trim();
        (!helper.is_empty()).then_some(helper)
    }
}

impl AgentConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml(content: &str) -> AgentResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AgentError::invalid_config("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                AgentError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(AgentError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    /// Detection period
    pub fn detect_interval(&self) -> Duration {
        Duration::from_secs(self.uplink.detect_interval_secs)
    }

    /// Error queue drain period
    pub fn error_queue_interval(&self) -> Duration {
        Duration::from_secs(self.uplink.error_queue_interval_secs)
    }

    /// VDP refresh period
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.vdp.refresh_interval_secs)
    }

    /// Flow consistency check period
    pub fn flow_check_interval(&self) -> Duration {
        Duration::from_secs(self.vdp.flow_check_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> AgentResult<()> {
        if self.bridges.integration_bridge.is_empty() {
            return Err(AgentError::invalid_config("bridges.integration_bridge", "must not be empty"));
        }
        if self.bridges.external_bridge.is_empty() {
            return Err(AgentError::invalid_config("bridges.external_bridge", "must not be empty"));
        }
        if self.bridges.integration_bridge == self.bridges.external_bridge {
            return Err(AgentError::invalid_config(
                "bridges",
                "integration and external bridge must differ",
            ));
        }
        if self.uplink.down_threshold == 0 {
            return Err(AgentError::invalid_config("uplink.down_threshold", "must be > 0"));
        }
        if self.uplink.static_uplink
            && self
                .uplink
                .static_uplink_port
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(AgentError::invalid_config(
                "uplink.static_uplink_port",
                "required when static_uplink is set",
            ));
        }
        for (field, secs) in [
            ("uplink.detect_interval_secs", self.uplink.detect_interval_secs),
            ("uplink.error_queue_interval_secs", self.uplink.error_queue_interval_secs),
            ("vdp.refresh_interval_secs", self.vdp.refresh_interval_secs),
            ("vdp.flow_check_interval_secs", self.vdp.flow_check_interval_secs),
        ] {
            if secs == 0 {
                return Err(AgentError::invalid_config(field, "must be > 0"));
            }
        }
        if self.vdp.vsiid_frmt != VSIID_FRMT_UUID {
            return Err(AgentError::invalid_config(
                "vdp.vsiid_frmt",
                format!("unsupported VSI id format {}", self.vdp.vsiid_frmt),
            ));
        }
        if !(FILTER_FRMT_VID..=FILTER_FRMT_GIDMACVID).contains(&self.vdp.filter_frmt) {
            return Err(AgentError::invalid_config(
                "vdp.filter_frmt",
                format!("unsupported filter format {}", self.vdp.filter_frmt),
            ));
        }
        Ok(())
    }
}
