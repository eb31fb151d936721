//! Broker privilege channel
//!
//! The broker is a separately installed service (Shizuku) that runs commands
//! with an elevated shell identity without full root. appwall talks to it
//! through [`BrokerChannel`]; [`RishBroker`] is the real implementation built
//! on the `rish` shell, and [`BrokerProbe`] maps the service state onto a
//! [`PrivilegeStatus`].

use super::{PrivilegeKind, PrivilegeSource, PrivilegeStatus};
use crate::core::error::{Error, Result};
use crate::shell::{ShellOutput, binary_exists, broker_program, run_with_timeout};
use crate::validators::{validate_app_uid, validate_package_name};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Marker echoed by the liveness probe.
const ALIVE_MARKER: &str = "appwall-broker-ok";

/// State of the broker service as seen from this app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    NotInstalled,
    InstalledNotRunning,
    Running { granted: bool },
}

impl From<BrokerState> for PrivilegeStatus {
    fn from(state: BrokerState) -> Self {
        match state {
            BrokerState::NotInstalled => PrivilegeStatus::Unavailable,
            BrokerState::InstalledNotRunning => PrivilegeStatus::InstalledNotRunning,
            BrokerState::Running { granted: false } => PrivilegeStatus::AvailableNoPermission,
            BrokerState::Running { granted: true } => PrivilegeStatus::AvailableWithPermission,
        }
    }
}

/// Privileged system APIs reachable through the broker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn state(&self) -> BrokerState;

    /// Enables or disables the connectivity firewall chain used for per-package blocking.
    async fn set_firewall_chain_enabled(&self, enabled: bool) -> Result<()>;

    /// Allows (`true`) or denies (`false`) networking for `package`.
    async fn set_package_networking(&self, package: &str, enabled: bool) -> Result<()>;

    /// Adds or removes `uid` from the background-restriction deny list.
    async fn set_uid_restricted(&self, uid: u32, restricted: bool) -> Result<()>;
}

/// `rish`-backed broker channel
#[derive(Debug, Clone)]
pub struct RishBroker {
    program: String,
    timeout: Duration,
}

impl RishBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: broker_program(),
            timeout,
        }
    }

    async fn run(&self, command: &str) -> Result<ShellOutput> {
        run_with_timeout(
            &self.program,
            &["-c", command],
            None,
            self.timeout,
            "broker command",
        )
        .await
    }

    async fn run_checked(&self, command: &str) -> Result<()> {
        self.run(command)
            .await?
            .check(|message| Error::Unavailable(format!("broker: {message}")))?;
        Ok(())
    }
}

/// Whether broker stderr says the service is installed but not started.
fn reports_not_running(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not running") || lower.contains("binder") || lower.contains("not alive")
}

#[async_trait]
impl BrokerChannel for RishBroker {
    async fn state(&self) -> BrokerState {
        if !binary_exists(&self.program) {
            return BrokerState::NotInstalled;
        }

        match self.run(&format!("echo {ALIVE_MARKER}")).await {
            Ok(output) if output.success() && output.stdout.contains(ALIVE_MARKER) => {
                BrokerState::Running { granted: true }
            }
            Ok(output) if reports_not_running(&output.stderr) => BrokerState::InstalledNotRunning,
            Ok(output) => {
                debug!("Broker refused probe: {}", output.stderr.trim());
                BrokerState::Running { granted: false }
            }
            Err(Error::Unavailable(_)) => BrokerState::NotInstalled,
            Err(e) => {
                debug!("Broker probe failed: {}", e);
                BrokerState::Running { granted: false }
            }
        }
    }

    async fn set_firewall_chain_enabled(&self, enabled: bool) -> Result<()> {
        self.run_checked(&format!("cmd connectivity set-chain3-enabled {enabled}"))
            .await
    }

    async fn set_package_networking(&self, package: &str, enabled: bool) -> Result<()> {
        validate_package_name(package).map_err(|message| Error::InvalidRule {
            key: package.to_string(),
            message,
        })?;
        self.run_checked(&format!(
            "cmd connectivity set-package-networking-enabled {enabled} {package}"
        ))
        .await
    }

    async fn set_uid_restricted(&self, uid: u32, restricted: bool) -> Result<()> {
        let uid = validate_app_uid(uid).map_err(Error::Internal)?;
        let verb = if restricted { "add" } else { "remove" };
        self.run_checked(&format!(
            "cmd netpolicy {verb} restrict-background-blacklist {uid}"
        ))
        .await
    }
}

/// Maps the broker service state onto a privilege status.
pub struct BrokerProbe {
    channel: Arc<dyn BrokerChannel>,
}

impl BrokerProbe {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl PrivilegeSource for BrokerProbe {
    fn kind(&self) -> PrivilegeKind {
        PrivilegeKind::Broker
    }

    async fn probe(&self) -> PrivilegeStatus {
        self.channel.state().await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticBroker(BrokerState);

    #[async_trait]
    impl BrokerChannel for StaticBroker {
        async fn state(&self) -> BrokerState {
            self.0
        }

        async fn set_firewall_chain_enabled(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }

        async fn set_package_networking(&self, _package: &str, _enabled: bool) -> Result<()> {
            Ok(())
        }

        async fn set_uid_restricted(&self, _uid: u32, _restricted: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broker_state_distinguishes_every_case() {
        let cases = [
            (BrokerState::NotInstalled, PrivilegeStatus::Unavailable),
            (
                BrokerState::InstalledNotRunning,
                PrivilegeStatus::InstalledNotRunning,
            ),
            (
                BrokerState::Running { granted: false },
                PrivilegeStatus::AvailableNoPermission,
            ),
            (
                BrokerState::Running { granted: true },
                PrivilegeStatus::AvailableWithPermission,
            ),
        ];
        for (state, expected) in cases {
            let probe = BrokerProbe::new(Arc::new(StaticBroker(state)));
            assert_eq!(probe.probe().await, expected, "{state:?}");
        }
    }

    #[test]
    fn test_not_running_detection() {
        assert!(reports_not_running("Server is not running"));
        assert!(reports_not_running("binder not alive"));
        assert!(!reports_not_running("Permission denied"));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_package_before_running() {
        let broker = RishBroker {
            program: "appwall_nonexistent_binary_xyz".into(),
            timeout: Duration::from_secs(1),
        };
        let result = broker.set_package_networking("com.x; reboot", false).await;
        assert!(matches!(result, Err(Error::InvalidRule { .. })));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let broker = RishBroker {
            program: "appwall_nonexistent_binary_xyz".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(broker.state().await, BrokerState::NotInstalled);
    }
}
