//! Firewall lifecycle state, backend identity and selection mode
//!
//! The orchestrator is the only writer of [`FirewallState`] and
//! [`BackendSnapshot`]; everything else holds a `watch::Receiver`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of enforcement mechanisms.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackendType {
    /// Local no-forwarding VPN; always present, occupies the VPN slot
    Vpn,
    /// Root-gated iptables owner-match rules
    KernelRules,
    /// Broker-gated connectivity firewall chain (newer OS versions)
    BrokerConnectivity,
    /// Broker-gated network policy (older OS versions)
    BrokerLegacyPolicy,
}

impl BackendType {
    /// Candidate order for AUTO selection, best first.
    pub const AUTO_ORDER: [BackendType; 4] = [
        BackendType::KernelRules,
        BackendType::BrokerConnectivity,
        BackendType::BrokerLegacyPolicy,
        BackendType::Vpn,
    ];

    /// Human readable name for notifications and CLI output
    pub const fn display_name(self) -> &'static str {
        match self {
            BackendType::Vpn => "VPN",
            BackendType::KernelRules => "Root (iptables)",
            BackendType::BrokerConnectivity => "Broker (connectivity)",
            BackendType::BrokerLegacyPolicy => "Broker (network policy)",
        }
    }

    /// Whether the backend occupies the OS's single VPN slot
    pub const fn uses_vpn_slot(self) -> bool {
        matches!(self, BackendType::Vpn)
    }
}

/// Requested backend selection mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    #[default]
    Auto,
    Forced(BackendType),
}

impl FirewallMode {
    /// Candidates to evaluate, in order.
    pub fn candidates(self) -> Vec<BackendType> {
        match self {
            FirewallMode::Auto => BackendType::AUTO_ORDER.to_vec(),
            FirewallMode::Forced(backend) => vec![backend],
        }
    }

    pub fn is_auto(self) -> bool {
        matches!(self, FirewallMode::Auto)
    }
}

impl fmt::Display for FirewallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallMode::Auto => write!(f, "auto"),
            FirewallMode::Forced(backend) => write!(f, "{backend}"),
        }
    }
}

impl FromStr for FirewallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "auto" {
            return Ok(FirewallMode::Auto);
        }
        BackendType::from_str(&s).map(FirewallMode::Forced).map_err(|_| {
            format!(
                "Invalid mode '{s}'. Valid options: auto, vpn, kernel-rules, broker-connectivity, broker-legacy-policy"
            )
        })
    }
}

/// Process-wide firewall lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallState {
    #[default]
    Stopped,
    Starting,
    Running(BackendType),
    /// Start failed; no backend is held. A new start is accepted from here.
    Error(String),
}

impl FirewallState {
    pub fn is_running(&self) -> bool {
        matches!(self, FirewallState::Running(_))
    }

    pub fn backend(&self) -> Option<BackendType> {
        match self {
            FirewallState::Running(backend) => Some(*backend),
            _ => None,
        }
    }
}

impl fmt::Display for FirewallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallState::Stopped => write!(f, "stopped"),
            FirewallState::Starting => write!(f, "starting"),
            FirewallState::Running(backend) => write!(f, "running ({backend})"),
            FirewallState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Active backend together with the switch-in-progress marker.
///
/// Published as a single value: `active == None && switching` means a switch
/// is in flight, `active == None && !switching` means stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendSnapshot {
    pub active: Option<BackendType>,
    pub switching: bool,
}

impl BackendSnapshot {
    pub const STOPPED: Self = Self {
        active: None,
        switching: false,
    };

    pub const SWITCHING: Self = Self {
        active: None,
        switching: true,
    };

    pub fn running(backend: BackendType) -> Self {
        Self {
            active: Some(backend),
            switching: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.active.is_none() && !self.switching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_order_prefers_kernel_and_ends_with_vpn() {
        assert_eq!(BackendType::AUTO_ORDER[0], BackendType::KernelRules);
        assert_eq!(BackendType::AUTO_ORDER[3], BackendType::Vpn);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("auto".parse::<FirewallMode>(), Ok(FirewallMode::Auto));
        assert_eq!(
            "kernel-rules".parse::<FirewallMode>(),
            Ok(FirewallMode::Forced(BackendType::KernelRules))
        );
        assert_eq!(
            "VPN".parse::<FirewallMode>(),
            Ok(FirewallMode::Forced(BackendType::Vpn))
        );
        assert!("iptables".parse::<FirewallMode>().is_err());
    }

    #[test]
    fn test_mode_display_roundtrips_through_parse() {
        let mode = FirewallMode::Forced(BackendType::BrokerLegacyPolicy);
        assert_eq!(mode.to_string().parse::<FirewallMode>(), Ok(mode));
    }

    #[test]
    fn test_forced_mode_has_single_candidate() {
        assert_eq!(
            FirewallMode::Forced(BackendType::Vpn).candidates(),
            vec![BackendType::Vpn]
        );
        assert_eq!(FirewallMode::Auto.candidates().len(), 4);
    }

    #[test]
    fn test_snapshot_markers() {
        assert!(BackendSnapshot::STOPPED.is_stopped());
        assert!(!BackendSnapshot::SWITCHING.is_stopped());
        assert!(!BackendSnapshot::running(BackendType::Vpn).is_stopped());
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&FirewallMode::Forced(BackendType::KernelRules)).unwrap();
        assert_eq!(json, r#"{"forced":"kernel-rules"}"#);
        let auto: FirewallMode = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(auto, FirewallMode::Auto);
    }
}
