//! Broker connectivity-chain backend
//!
//! Enables the connectivity service's third OEM deny chain and toggles
//! per-package networking through the broker. The chain is keyed by
//! package, so a package blocked in any profile is denied in all of them.

use super::{Backend, CONNECTIVITY_MIN_SDK, fingerprint, require_privilege};
use crate::core::error::{Error, Result};
use crate::core::evaluator::{ApplyContext, evaluate_all};
use crate::core::rule::Rule;
use crate::core::state::BackendType;
use crate::privilege::broker::BrokerChannel;
use crate::privilege::{PrivilegeKind, PrivilegeMonitor};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Applied {
    fingerprint: Option<String>,
    denied: BTreeSet<String>,
}

pub struct ConnectivityBackend {
    broker: Arc<dyn BrokerChannel>,
    monitor: PrivilegeMonitor,
    sdk: u32,
    applied: Mutex<Applied>,
    active: AtomicBool,
}

impl ConnectivityBackend {
    pub fn new(broker: Arc<dyn BrokerChannel>, monitor: PrivilegeMonitor, sdk: u32) -> Self {
        Self {
            broker,
            monitor,
            sdk,
            applied: Mutex::new(Applied::default()),
            active: AtomicBool::new(false),
        }
    }
}

/// Packages to deny: blocked in at least one profile.
fn denied_packages(rules: &[Rule], ctx: &ApplyContext) -> BTreeSet<String> {
    let mut by_package: BTreeMap<String, bool> = BTreeMap::new();
    for v in evaluate_all(rules, ctx) {
        *by_package.entry(v.package).or_default() |= v.blocked;
    }
    by_package
        .into_iter()
        .filter_map(|(package, blocked)| blocked.then_some(package))
        .collect()
}

fn apply_failed(e: Error) -> Error {
    match e {
        Error::PermissionDenied(_) | Error::Timeout { .. } | Error::ApplyFailed { .. } => e,
        other => Error::ApplyFailed {
            backend: BackendType::BrokerConnectivity,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl Backend for ConnectivityBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::BrokerConnectivity
    }

    async fn check_availability(&self) -> Result<()> {
        if self.sdk < CONNECTIVITY_MIN_SDK {
            return Err(Error::VersionUnsupported {
                required: CONNECTIVITY_MIN_SDK,
                found: self.sdk,
            });
        }
        require_privilege(PrivilegeKind::Broker, self.monitor.status())
    }

    async fn start(&self) -> Result<()> {
        self.check_availability().await?;
        let _guard = self.applied.lock().await;
        self.broker
            .set_firewall_chain_enabled(true)
            .await
            .map_err(apply_failed)?;
        self.active.store(true, Ordering::SeqCst);
        info!("Connectivity backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        let mut first_error = None;

        for package in std::mem::take(&mut applied.denied) {
            if let Err(e) = self.broker.set_package_networking(&package, true).await {
                warn!("Failed to re-enable networking for {}: {}", package, e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.broker.set_firewall_chain_enabled(false).await {
            warn!("Failed to disable connectivity chain: {}", e);
            first_error.get_or_insert(e);
        }

        applied.fingerprint = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Connectivity backend stopped");
        first_error.map_or(Ok(()), Err)
    }

    async fn apply_rules(&self, rules: &[Rule], ctx: &ApplyContext) -> Result<()> {
        let desired = denied_packages(rules, ctx);
        let digest = fingerprint(&desired)?;

        let mut applied = self.applied.lock().await;
        if applied.fingerprint.as_deref() == Some(digest.as_str()) {
            debug!("Connectivity deny set unchanged, skipping apply");
            return Ok(());
        }

        let to_allow: Vec<String> = applied.denied.difference(&desired).cloned().collect();
        let to_deny: Vec<String> = desired.difference(&applied.denied).cloned().collect();

        for package in to_deny {
            self.broker
                .set_package_networking(&package, false)
                .await
                .map_err(apply_failed)?;
            applied.denied.insert(package);
        }
        for package in to_allow {
            self.broker
                .set_package_networking(&package, true)
                .await
                .map_err(apply_failed)?;
            applied.denied.remove(&package);
        }

        applied.fingerprint = Some(digest);
        info!(
            "Applied connectivity rules: {} packages denied",
            applied.denied.len()
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{NetworkClass, RuleChange};
    use crate::privilege::PrivilegeStatus;
    use crate::privilege::broker::BrokerState;
    use crate::privilege::testing::FixedSource;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingBroker {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerChannel for RecordingBroker {
        async fn state(&self) -> BrokerState {
            BrokerState::Running { granted: true }
        }

        async fn set_firewall_chain_enabled(&self, enabled: bool) -> Result<()> {
            self.calls.lock().unwrap().push(format!("chain {enabled}"));
            Ok(())
        }

        async fn set_package_networking(&self, package: &str, enabled: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("pkg {package} {enabled}"));
            Ok(())
        }

        async fn set_uid_restricted(&self, _uid: u32, _restricted: bool) -> Result<()> {
            unreachable!("connectivity backend never uses netpolicy")
        }
    }

    async fn backend(sdk: u32) -> (ConnectivityBackend, Arc<RecordingBroker>) {
        let monitor = PrivilegeMonitor::new(
            FixedSource::new(PrivilegeKind::Broker, PrivilegeStatus::AvailableWithPermission),
            Duration::from_secs(1),
        );
        monitor.recheck().await;
        let broker = Arc::new(RecordingBroker::default());
        (ConnectivityBackend::new(broker.clone(), monitor, sdk), broker)
    }

    fn wifi() -> ApplyContext {
        ApplyContext {
            network: NetworkClass::Wifi,
            ..ApplyContext::default()
        }
    }

    #[tokio::test]
    async fn test_old_sdk_is_unsupported() {
        let (backend, _) = backend(33).await;
        assert!(matches!(
            backend.check_availability().await,
            Err(Error::VersionUnsupported {
                required: 34,
                found: 33
            })
        ));
    }

    #[tokio::test]
    async fn test_apply_diffs_deny_set() {
        let (backend, broker) = backend(34).await;
        backend.start().await.unwrap();

        let mut a = Rule::new("com.a", 0, 10_100, "A");
        a.apply_change(RuleChange::Wifi(true));
        let b = Rule::new("com.b", 0, 10_200, "B");
        backend.apply_rules(&[a.clone(), b.clone()], &wifi()).await.unwrap();

        // Same verdicts again: no broker traffic
        backend.apply_rules(&[a.clone(), b.clone()], &wifi()).await.unwrap();

        a.apply_change(RuleChange::Wifi(false));
        let mut b = b;
        b.apply_change(RuleChange::Wifi(true));
        backend.apply_rules(&[a, b], &wifi()).await.unwrap();

        assert_eq!(
            *broker.calls.lock().unwrap(),
            vec![
                "chain true",
                "pkg com.a false",
                "pkg com.b false",
                "pkg com.a true",
            ]
        );
    }

    #[test]
    fn test_blocked_in_any_profile_denies_package() {
        let mut personal = Rule::new("com.a", 0, 10_100, "A");
        personal.apply_change(RuleChange::Wifi(true));
        let work = Rule::new("com.a", 10, 10_100, "A");
        let denied = denied_packages(&[personal, work], &wifi());
        assert_eq!(denied.into_iter().collect::<Vec<_>>(), vec!["com.a"]);
    }

    #[tokio::test]
    async fn test_stop_restores_packages() {
        let (backend, broker) = backend(35).await;
        backend.start().await.unwrap();
        let mut a = Rule::new("com.a", 0, 10_100, "A");
        a.apply_change(RuleChange::Wifi(true));
        backend.apply_rules(&[a], &wifi()).await.unwrap();
        backend.stop().await.unwrap();

        let calls = broker.calls.lock().unwrap();
        assert_eq!(&calls[calls.len() - 2..], ["pkg com.a true", "chain false"]);
        assert!(!backend.is_active());
    }
}
