//! Configuration file support for vcenter-manager
//!
//! Loads and validates the manager configuration from YAML files.
//! Default location: /etc/vcenter-manager/config.yaml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use vcm_common::{Backoff, VcmError, VcmResult};
use vcm_types::VlanId;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vcenter-manager/config.yaml";

/// Hypervisor (vCenter) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// vCenter server address
    #[serde(default = "default_hypervisor_server")]
    pub server: String,

    /// Name of the ESXi host this manager runs for
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Datacenter holding the managed VMs
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Distributed switch carrying the managed port groups
    #[serde(default = "default_dvswitch")]
    pub dvswitch: String,

    /// Name prefix of the dataplane agent VMs, which are never mirrored
    #[serde(default = "default_agent_vm_prefix")]
    pub agent_vm_prefix: String,
}

/// SDN controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller API address
    #[serde(default = "default_controller_server")]
    pub server: String,

    /// Controller API port
    #[serde(default = "default_controller_port")]
    pub port: u16,

    /// Domain owning the project
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Project owning every object this manager creates
    #[serde(default = "default_project")]
    pub project: String,

    /// Security group attached to every interface
    #[serde(default = "default_security_group")]
    pub security_group: String,

    /// Network IPAM used for internally managed addresses
    #[serde(default = "default_ipam")]
    pub ipam: String,
}

/// Dataplane agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Agent REST address
    #[serde(default = "default_agent_address")]
    pub address: String,

    /// Agent REST port
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

/// Scope of VLAN id uniqueness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VlanScope {
    /// One allocator shared by every network on the host
    #[default]
    Global,
    /// One allocator per virtual network
    PerNetwork,
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// First assignable VLAN id
    #[serde(default = "default_vlan_start")]
    pub vlan_start: u16,

    /// Last assignable VLAN id
    #[serde(default = "default_vlan_end")]
    pub vlan_end: u16,

    /// Scope of VLAN id uniqueness
    #[serde(default)]
    pub vlan_scope: VlanScope,

    /// Seconds a liveness probe may take before the event task is restarted
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    /// Seconds between liveness probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Factor applied to the delay after each failed reconnect
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Complete vcenter-manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub dataplane: DataplaneConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_hypervisor_server() -> String {
    "127.0.0.1".to_string()
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_datacenter() -> String {
    "Datacenter".to_string()
}

fn default_dvswitch() -> String {
    "dvSwitch".to_string()
}

fn default_agent_vm_prefix() -> String {
    "ContrailVM".to_string()
}

fn default_controller_server() -> String {
    "127.0.0.1".to_string()
}

fn default_controller_port() -> u16 {
    8082
}

fn default_domain() -> String {
    "default-domain".to_string()
}

fn default_project() -> String {
    "vCenter".to_string()
}

fn default_security_group() -> String {
    "default".to_string()
}

fn default_ipam() -> String {
    "vCenter-ipam".to_string()
}

fn default_agent_address() -> String {
    "127.0.0.1".to_string()
}

fn default_agent_port() -> u16 {
    9091
}

fn default_vlan_start() -> u16 {
    VlanId::MIN
}

fn default_vlan_end() -> u16 {
    VlanId::MAX
}

fn default_liveness_timeout() -> u64 {
    25
}

fn default_probe_interval() -> u64 {
    30
}

fn default_backoff_initial() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            server: default_hypervisor_server(),
            local_host: default_local_host(),
            datacenter: default_datacenter(),
            dvswitch: default_dvswitch(),
            agent_vm_prefix: default_agent_vm_prefix(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server: default_controller_server(),
            port: default_controller_port(),
            domain: default_domain(),
            project: default_project(),
            security_group: default_security_group(),
            ipam: default_ipam(),
        }
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            port: default_agent_port(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            vlan_start: default_vlan_start(),
            vlan_end: default_vlan_end(),
            vlan_scope: VlanScope::default(),
            liveness_timeout_secs: default_liveness_timeout(),
            probe_interval_secs: default_probe_interval(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl ManagerConfig {
    /// Parses a YAML document.
    pub fn from_yaml(content: &str) -> VcmResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| VcmError::invalid_config("config", e.to_string()))
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> VcmResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content).map_err(|e| {
                VcmError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "vcenter-manager: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(VcmError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> VcmResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Get liveness probe timeout as Duration
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.liveness_timeout_secs)
    }

    /// Get probe interval as Duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.sync.probe_interval_secs)
    }

    /// Reconnect backoff policy
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.sync.backoff_initial_ms),
            Duration::from_millis(self.sync.backoff_max_ms),
            self.sync.backoff_multiplier,
        )
    }

    /// VLAN range as validated ids
    pub fn vlan_range(&self) -> VcmResult<(VlanId, VlanId)> {
        let start = VlanId::new(self.sync.vlan_start)
            .map_err(|e| VcmError::invalid_config("sync.vlan_start", e.to_string()))?;
        let end = VlanId::new(self.sync.vlan_end)
            .map_err(|e| VcmError::invalid_config("sync.vlan_end", e.to_string()))?;
        Ok((start, end))
    }

    /// Validate configuration
    pub fn validate(&self) -> VcmResult<()> {
        let (start, end) = self.vlan_range()?;
        if start > end {
            return Err(VcmError::invalid_config(
                "sync.vlan_start",
                format!("must not exceed vlan_end ({} > {})", start, end),
            ));
        }

        if self.sync.liveness_timeout_secs == 0 {
            return Err(VcmError::invalid_config(
                "sync.liveness_timeout_secs",
                "must be > 0",
            ));
        }

        if self.sync.probe_interval_secs == 0 {
            return Err(VcmError::invalid_config(
                "sync.probe_interval_secs",
                "must be > 0",
            ));
        }

        if self.sync.backoff_initial_ms > self.sync.backoff_max_ms {
            return Err(VcmError::invalid_config(
                "sync.backoff_initial_ms",
                "must not exceed backoff_max_ms",
            ));
        }

        for (field, value) in [
            ("hypervisor.local_host", &self.hypervisor.local_host),
            ("controller.domain", &self.controller.domain),
            ("controller.project", &self.controller.project),
            ("controller.ipam", &self.controller.ipam),
        ] {
            if value.trim().is_empty() {
                return Err(VcmError::invalid_config(field, "must not be empty"));
            }
        }

        if self.dataplane.port == 0 {
            return Err(VcmError::invalid_config("dataplane.port", "must be > 0"));
        }

        Ok(())
    }
}
