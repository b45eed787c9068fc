//! Runtime state of a VM and of its dataplane ports.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Power state of a VM as reported in `runtime.powerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    /// The VM is running.
    PoweredOn,
    /// The VM is stopped (default for a VM that was never observed running).
    #[default]
    PoweredOff,
    /// The VM is suspended to disk.
    Suspended,
}

impl PowerState {
    /// Returns true if the VM is running.
    pub const fn is_on(&self) -> bool {
        matches!(self, PowerState::PoweredOn)
    }

    /// The admin state the VM's dataplane ports should have.
    pub const fn port_admin_state(&self) -> AdminState {
        match self {
            PowerState::PoweredOn => AdminState::Up,
            PowerState::PoweredOff | PowerState::Suspended => AdminState::Down,
        }
    }

    /// Returns the hypervisor's name for this state.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poweredOn" => Ok(PowerState::PoweredOn),
            "poweredOff" => Ok(PowerState::PoweredOff),
            "suspended" => Ok(PowerState::Suspended),
            _ => Err(ParseError::InvalidPowerState(s.to_string())),
        }
    }
}

/// Guest tools status as reported in `guest.toolsRunningStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ToolsStatus {
    /// `guestToolsRunning`
    Running,
    /// `guestToolsNotRunning`
    #[default]
    NotRunning,
    /// `guestToolsExecutingScripts`
    ExecutingScripts,
}

impl ToolsStatus {
    /// Returns true when the guest agent reports running.
    ///
    /// Tools that are still executing startup scripts do not report guest
    /// network information yet, so they count as not running.
    pub const fn is_running(&self) -> bool {
        matches!(self, ToolsStatus::Running)
    }

    /// Parses the hypervisor string; unknown values count as not running.
    pub fn from_hypervisor(s: &str) -> Self {
        match s {
            "guestToolsRunning" => ToolsStatus::Running,
            "guestToolsExecutingScripts" => ToolsStatus::ExecutingScripts,
            _ => ToolsStatus::NotRunning,
        }
    }
}

/// Administrative state of a dataplane port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    /// Port is administratively down (default for new ports).
    #[default]
    Down,
    /// Port is administratively up.
    Up,
}

impl AdminState {
    /// Returns true if the port is administratively up.
    pub const fn is_up(&self) -> bool {
        matches!(self, AdminState::Up)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Up => f.write_str("up"),
            AdminState::Down => f.write_str("down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_power_state_round_trip_names() {
        for state in [
            PowerState::PoweredOn,
            PowerState::PoweredOff,
            PowerState::Suspended,
        ] {
            assert_eq!(state.as_str().parse::<PowerState>().unwrap(), state);
        }
        assert!("on".parse::<PowerState>().is_err());
    }

    #[test]
    fn test_port_admin_state_follows_power() {
        assert!(PowerState::PoweredOn.port_admin_state().is_up());
        assert!(!PowerState::PoweredOff.port_admin_state().is_up());
        assert!(!PowerState::Suspended.port_admin_state().is_up());
    }

    #[test]
    fn test_tools_status() {
        assert!(ToolsStatus::from_hypervisor("guestToolsRunning").is_running());
        assert!(!ToolsStatus::from_hypervisor("guestToolsExecutingScripts").is_running());
        assert_eq!(
            ToolsStatus::from_hypervisor("somethingNew"),
            ToolsStatus::NotRunning
        );
    }

    #[test]
    fn test_power_state_serde_name() {
        assert_eq!(PowerState::default(), PowerState::PoweredOff);
        assert_eq!(AdminState::Up.to_string(), "up");
    }
}
