//! Firewall orchestrator
//!
//! Owns the firewall lifecycle (`Stopped → Starting → Running → Stopped`,
//! `Error` reachable from `Starting`), selects a backend, swaps backends
//! make-before-break and re-applies rules when device conditions or the
//! rule store change.
//!
//! # Start sequence
//!
//! 1. [`Orchestrator::plan_start`] evaluates candidates in priority order and
//!    returns a [`StartPlan`] before any privileged action. A VPN plan may
//!    need OS consent, which only the UI can obtain.
//! 2. [`Orchestrator::start`] takes the plan plus the UI's [`Consent`],
//!    starts the backend, applies rules, and only then publishes `Running`.
//!
//! # Concurrency
//!
//! - One async mutex guards the active backend; start, stop, switch and
//!   reconfigure all run under it
//! - Reconfigure requests are debounced; a newer request aborts the pending one
//! - A user stop bumps a generation counter so switches requested before it
//!   are discarded
//! - The active backend and the switch-in-progress flag are published
//!   together as one [`BackendSnapshot`]

use crate::audit::{AuditLog, EventType};
use crate::backend::{Backend, BackendSet};
use crate::config::SettingsStore;
use crate::core::error::{Error, Result};
use crate::core::evaluator::ApplyContext;
use crate::core::inventory::{PackageInventory, reconcile};
use crate::core::rule::DefaultPolicy;
use crate::core::state::{BackendSnapshot, BackendType, FirewallMode, FirewallState};
use crate::core::store::RuleStore;
use crate::device::DeviceConditions;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backend choice computed before any privileged action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartPlan {
    pub mode: FirewallMode,
    pub backend: BackendType,
    /// The UI must obtain OS VPN consent before calling [`Orchestrator::start`]
    pub needs_vpn_consent: bool,
}

/// The UI's answer to a [`StartPlan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Denied,
    NotRequired,
}

/// Outcome of [`Orchestrator::apply_mode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Mode persisted; the firewall is not running
    Saved,
    /// Running backend already matches the new mode
    Unchanged,
    Switched(BackendType),
    /// The new backend needs VPN consent; finish with [`Orchestrator::complete_switch`]
    ConsentRequired(StartPlan),
}

struct Inner {
    backends: BackendSet,
    store: Arc<dyn RuleStore>,
    inventory: Option<Arc<dyn PackageInventory>>,
    settings: Arc<SettingsStore>,
    audit: AuditLog,
    debounce: Duration,
    state: watch::Sender<FirewallState>,
    snapshot: watch::Sender<BackendSnapshot>,
    conditions: watch::Sender<DeviceConditions>,
    active: Mutex<Option<Arc<dyn Backend>>>,
    pending: std::sync::Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

/// Cheap-to-clone handle to the firewall control plane
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub async fn new(
        backends: BackendSet,
        store: Arc<dyn RuleStore>,
        settings: Arc<SettingsStore>,
        audit: AuditLog,
    ) -> Self {
        Self::build(backends, store, None, settings, audit).await
    }

    /// Like [`Orchestrator::new`], but reconciles the rule store against
    /// `inventory` before every apply. Packages installed since the last pass
    /// get an inert rule and therefore follow the default policy on every
    /// backend.
    pub async fn with_inventory(
        backends: BackendSet,
        store: Arc<dyn RuleStore>,
        inventory: Arc<dyn PackageInventory>,
        settings: Arc<SettingsStore>,
        audit: AuditLog,
    ) -> Self {
        Self::build(backends, store, Some(inventory), settings, audit).await
    }

    async fn build(
        backends: BackendSet,
        store: Arc<dyn RuleStore>,
        inventory: Option<Arc<dyn PackageInventory>>,
        settings: Arc<SettingsStore>,
        audit: AuditLog,
    ) -> Self {
        let debounce = settings.get().await.debounce();
        Self {
            inner: Arc::new(Inner {
                backends,
                store,
                inventory,
                settings,
                audit,
                debounce,
                state: watch::Sender::new(FirewallState::Stopped),
                snapshot: watch::Sender::new(BackendSnapshot::STOPPED),
                conditions: watch::Sender::new(DeviceConditions::default()),
                active: Mutex::new(None),
                pending: std::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> FirewallState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FirewallState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        *self.inner.snapshot.borrow()
    }

    /// Active backend and switch-in-progress flag, always read together.
    pub fn subscribe_backend(&self) -> watch::Receiver<BackendSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.inner.settings
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn backends(&self) -> &BackendSet {
        &self.inner.backends
    }

    pub fn conditions(&self) -> DeviceConditions {
        *self.inner.conditions.borrow()
    }

    /// Records new device conditions and schedules a reconfigure if they changed.
    pub fn set_conditions(&self, conditions: DeviceConditions) {
        let changed = self.inner.conditions.send_if_modified(|c| {
            if *c == conditions {
                false
            } else {
                *c = conditions;
                true
            }
        });
        if changed {
            debug!("Conditions now {:?}", conditions);
            self.request_reconfigure();
        }
    }

    fn publish(&self, state: FirewallState) {
        debug!("Firewall state: {}", state);
        self.inner.state.send_replace(state);
    }

    fn publish_snapshot(&self, snapshot: BackendSnapshot) {
        self.inner.snapshot.send_replace(snapshot);
    }

    async fn context(&self) -> ApplyContext {
        let conditions = self.conditions();
        ApplyContext {
            network: conditions.network,
            screen_on: conditions.screen_on,
            default_policy: self.inner.settings.get().await.default_policy,
        }
    }

    /// Evaluates candidates for `mode` without touching the published state.
    ///
    /// In AUTO, availability failures drop the candidate. A forced mode
    /// returns its backend's error verbatim.
    pub async fn select(&self, mode: FirewallMode) -> Result<StartPlan> {
        let mut last_error = None;
        for candidate in mode.candidates() {
            let Some(backend) = self.inner.backends.get(candidate) else {
                debug!("Candidate {} not registered", candidate);
                last_error = Some(Error::Unavailable(format!("{candidate} not registered")));
                continue;
            };
            match backend.check_availability().await {
                Ok(()) => {
                    let needs_vpn_consent =
                        candidate.uses_vpn_slot() && backend.needs_consent().await;
                    return Ok(StartPlan {
                        mode,
                        backend: candidate,
                        needs_vpn_consent,
                    });
                }
                Err(e) => {
                    if e.is_availability() {
                        debug!("Candidate {} unavailable: {}", candidate, e);
                    } else {
                        warn!("Candidate {} failed its availability check: {}", candidate, e);
                    }
                    last_error = Some(e);
                }
            }
        }

        match (mode, last_error) {
            (FirewallMode::Forced(_), Some(e)) => Err(e),
            _ => Err(Error::Unavailable("no enforcement backend available".to_string())),
        }
    }

    /// Publishes `Starting` and computes the start plan.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the firewall is already running; otherwise the
    /// selection error, after publishing `Error`.
    pub async fn plan_start(&self, mode: FirewallMode) -> Result<StartPlan> {
        if self.snapshot().active.is_some() || self.state().is_running() {
            return Err(Error::InvalidState("firewall already running".to_string()));
        }
        self.publish(FirewallState::Starting);
        match self.select(mode).await {
            Ok(plan) => {
                info!(
                    "Start plan: {} (mode {}, consent needed: {})",
                    plan.backend, plan.mode, plan.needs_vpn_consent
                );
                Ok(plan)
            }
            Err(e) => {
                warn!("No backend for mode {}: {}", mode, e);
                self.publish(FirewallState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Starts the planned backend and applies the current rules.
    ///
    /// `Running` is published only after both steps succeed. On failure the
    /// backend is torn down and `Error(reason)` is published.
    pub async fn start(&self, plan: StartPlan, consent: Consent) -> Result<BackendType> {
        if consent == Consent::Denied {
            info!("VPN consent denied, firewall stays stopped");
            self.publish(FirewallState::Stopped);
            return Err(Error::PermissionDenied("VPN consent denied".to_string()));
        }
        if plan.needs_vpn_consent && consent != Consent::Granted {
            self.publish(FirewallState::Stopped);
            return Err(Error::PermissionDenied(
                "VPN consent required before starting".to_string(),
            ));
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(Error::InvalidState("firewall already running".to_string()));
        }
        if generation != self.inner.generation.load(Ordering::SeqCst) {
            self.publish(FirewallState::Stopped);
            return Err(Error::InvalidState("start cancelled by stop".to_string()));
        }

        let backend = self
            .inner
            .backends
            .get(plan.backend)
            .ok_or_else(|| Error::NotFound(format!("backend {}", plan.backend)))?;

        if let Err(e) = self.bring_up(&backend).await {
            error!("Failed to start {}: {}", plan.backend, e);
            self.publish(FirewallState::Error(e.to_string()));
            self.inner
                .audit
                .record(
                    EventType::StartFirewall,
                    false,
                    serde_json::json!({ "backend": plan.backend, "mode": plan.mode }),
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }

        *active = Some(backend);
        self.publish_snapshot(BackendSnapshot::running(plan.backend));
        self.publish(FirewallState::Running(plan.backend));
        drop(active);

        if let Err(e) = self
            .inner
            .settings
            .update(|s| {
                s.enabled = true;
                s.mode = plan.mode;
            })
            .await
        {
            warn!("Failed to persist enabled state: {}", e);
        }
        self.inner
            .audit
            .record(
                EventType::StartFirewall,
                true,
                serde_json::json!({ "backend": plan.backend, "mode": plan.mode }),
                None,
            )
            .await;
        info!("Firewall running on {}", plan.backend.display_name());
        Ok(plan.backend)
    }

    /// `start()` then the first `apply_rules()`; tears the backend down on failure.
    async fn bring_up(&self, backend: &Arc<dyn Backend>) -> Result<()> {
        let result = async {
            backend.start().await?;
            self.sync_inventory().await;
            let rules = self.inner.store.all().await?;
            let ctx = self.context().await;
            backend.apply_rules(&rules, &ctx).await
        }
        .await;

        if result.is_err()
            && let Err(e) = backend.stop().await
        {
            warn!(
                "Cleanup of {} after failed start also failed: {}",
                backend.backend_type(),
                e
            );
        }
        result
    }

    /// Plan and start in one step for callers that cannot show a consent prompt.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when the selected backend needs VPN consent.
    pub async fn start_with_mode(&self, mode: FirewallMode) -> Result<BackendType> {
        let plan = self.plan_start(mode).await?;
        if plan.needs_vpn_consent {
            self.abandon(plan);
            return Err(Error::PermissionDenied(
                "VPN consent required; open appwall to grant it".to_string(),
            ));
        }
        self.start(plan, Consent::NotRequired).await
    }

    /// Returns to `Stopped` after a plan the caller cannot carry out.
    pub fn abandon(&self, plan: StartPlan) {
        if self.state() == FirewallState::Starting {
            debug!("Abandoning start plan for {}", plan.backend);
            self.publish(FirewallState::Stopped);
        }
    }

    /// Stops the firewall. Always wins over background retries.
    pub async fn stop(&self) -> Result<()> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_pending();

        let mut active = self.inner.active.lock().await;
        let result = match active.take() {
            Some(backend) => {
                let kind = backend.backend_type();
                let result = backend.stop().await;
                if let Err(e) = &result {
                    error!("Failed to stop {}: {}", kind, e);
                }
                self.inner
                    .audit
                    .record(
                        EventType::StopFirewall,
                        result.is_ok(),
                        serde_json::json!({ "backend": kind }),
                        result.as_ref().err().map(ToString::to_string),
                    )
                    .await;
                result
            }
            None => Ok(()),
        };
        self.publish_snapshot(BackendSnapshot::STOPPED);
        self.publish(FirewallState::Stopped);
        drop(active);

        if let Err(e) = self.inner.settings.update(|s| s.enabled = false).await {
            warn!("Failed to persist disabled state: {}", e);
        }
        info!("Firewall stopped");
        result
    }

    /// Make-before-break switch to `target` while running.
    ///
    /// Observers see `running(old)`, then [`BackendSnapshot::SWITCHING`],
    /// then `running(target)`. On failure the old backend keeps enforcing and
    /// is republished.
    pub async fn switch_backend(&self, target: BackendType) -> Result<()> {
        self.switch_inner(target, false).await
    }

    /// Finishes a switch that returned [`ModeChange::ConsentRequired`].
    pub async fn complete_switch(&self, plan: StartPlan, consent: Consent) -> Result<()> {
        if consent == Consent::Denied {
            return Err(Error::PermissionDenied("VPN consent denied".to_string()));
        }
        self.switch_inner(plan.backend, consent == Consent::Granted)
            .await
    }

    async fn switch_inner(&self, target: BackendType, consent_granted: bool) -> Result<()> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let mut active = self.inner.active.lock().await;
        if generation != self.inner.generation.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("switch cancelled by stop".to_string()));
        }

        let Some(old) = active.clone() else {
            return Err(Error::InvalidState("firewall not running".to_string()));
        };
        let from = old.backend_type();
        if from == target {
            return Ok(());
        }

        let new = self
            .inner
            .backends
            .get(target)
            .ok_or_else(|| Error::NotFound(format!("backend {target}")))?;
        new.check_availability().await?;
        if !consent_granted && new.needs_consent().await {
            return Err(Error::PermissionDenied(
                "VPN consent required before switching".to_string(),
            ));
        }

        info!("Switching backend {} -> {}", from, target);
        self.publish_snapshot(BackendSnapshot::SWITCHING);

        if let Err(e) = self.bring_up(&new).await {
            error!("Switch to {} failed, keeping {}: {}", target, from, e);
            self.publish_snapshot(BackendSnapshot::running(from));
            self.inner
                .audit
                .record(
                    EventType::SwitchBackend,
                    false,
                    serde_json::json!({ "from": from, "to": target }),
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }

        if let Err(e) = old.stop().await {
            warn!("Old backend {} did not stop cleanly: {}", from, e);
        }
        *active = Some(new);
        self.publish_snapshot(BackendSnapshot::running(target));
        self.publish(FirewallState::Running(target));
        drop(active);

        self.inner
            .audit
            .record(
                EventType::SwitchBackend,
                true,
                serde_json::json!({ "from": from, "to": target }),
                None,
            )
            .await;
        Ok(())
    }

    /// Re-runs selection for the persisted mode and switches if a better
    /// backend is available. Returns the new backend, if any.
    pub async fn upgrade(&self) -> Result<Option<BackendType>> {
        let Some(current) = self.snapshot().active else {
            return Err(Error::InvalidState("firewall not running".to_string()));
        };
        let mode = self.inner.settings.get().await.mode;
        let plan = self.select(mode).await?;
        if plan.backend == current || plan.needs_vpn_consent {
            return Ok(None);
        }
        self.switch_backend(plan.backend).await?;
        Ok(Some(plan.backend))
    }

    /// Persists `mode` and, if running, moves to the backend it selects.
    pub async fn apply_mode(&self, mode: FirewallMode) -> Result<ModeChange> {
        self.inner.settings.update(|s| s.mode = mode).await?;

        let Some(current) = self.snapshot().active else {
            return Ok(ModeChange::Saved);
        };
        let plan = self.select(mode).await?;
        if plan.backend == current {
            return Ok(ModeChange::Unchanged);
        }
        if plan.needs_vpn_consent {
            return Ok(ModeChange::ConsentRequired(plan));
        }
        self.switch_backend(plan.backend).await?;
        Ok(ModeChange::Switched(plan.backend))
    }

    /// Persists the default policy and re-applies.
    pub async fn set_default_policy(&self, policy: DefaultPolicy) -> Result<()> {
        self.inner
            .settings
            .update(|s| s.default_policy = policy)
            .await?;
        self.request_reconfigure();
        Ok(())
    }

    /// Runs the active backend's boot-policy normalisation.
    pub async fn normalize_boot_policy(&self) -> Result<()> {
        let active = self.inner.active.lock().await;
        let Some(backend) = active.as_ref() else {
            return Err(Error::InvalidState("firewall not running".to_string()));
        };
        let result = backend.normalize_boot_policy().await;
        self.inner
            .audit
            .record(
                EventType::BootNormalize,
                result.is_ok(),
                serde_json::json!({ "backend": backend.backend_type() }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        result
    }

    /// Schedules a debounced re-evaluation. A newer request aborts the
    /// pending one (last writer wins).
    pub fn request_reconfigure(&self) {
        let this = self.clone();
        let delay = self.inner.debounce;
        let job = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.reconfigure().await {
                error!("Reconfigure failed: {}", e);
            }
        });

        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(job) {
            previous.abort();
        }
    }

    fn cancel_pending(&self) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = pending.take() {
            job.abort();
        }
    }

    /// Re-applies the full rule set to the active backend, if any.
    pub async fn reconfigure(&self) -> Result<()> {
        let active = self.inner.active.lock().await;
        let Some(backend) = active.as_ref() else {
            debug!("Reconfigure skipped: firewall not running");
            return Ok(());
        };
        self.sync_inventory().await;
        let rules = self.inner.store.all().await?;
        let ctx = self.context().await;
        let result = backend.apply_rules(&rules, &ctx).await;
        if let Err(e) = &result {
            self.inner
                .audit
                .record(
                    EventType::ApplyRules,
                    false,
                    serde_json::json!({
                        "backend": backend.backend_type(),
                        "rule_count": rules.len(),
                    }),
                    Some(e.to_string()),
                )
                .await;
        }
        result
    }

    /// Folds installed and removed packages into the rule store.
    ///
    /// A failing inventory leaves the store as it is; the known rules still
    /// apply.
    async fn sync_inventory(&self) {
        let Some(inventory) = &self.inner.inventory else {
            return;
        };
        if let Err(e) = reconcile(self.inner.store.as_ref(), inventory.as_ref()).await {
            warn!("Package inventory unavailable, applying known rules only: {}", e);
        }
    }

    /// Re-applies on every device-condition change and rule-store revision.
    pub fn spawn_event_loop(
        &self,
        mut conditions: watch::Receiver<DeviceConditions>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let mut revisions = self.inner.store.subscribe();
        this.set_conditions(*conditions.borrow_and_update());

        tokio::spawn(async move {
            let mut conditions_open = true;
            let mut revisions_open = true;
            while conditions_open || revisions_open {
                tokio::select! {
                    changed = conditions.changed(), if conditions_open => {
                        if changed.is_err() {
                            conditions_open = false;
                            continue;
                        }
                        let current = *conditions.borrow_and_update();
                        this.set_conditions(current);
                    }
                    changed = revisions.changed(), if revisions_open => {
                        if changed.is_err() {
                            revisions_open = false;
                            continue;
                        }
                        this.request_reconfigure();
                    }
                }
            }
            debug!("Event loop finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::Settings;
    use crate::core::inventory::{InstalledPackage, Profile, ProfileKind};
    use crate::core::rule::{NetworkClass, Rule, RuleChange, RuleKey};
    use crate::core::store::RuleTable;
    use async_trait::async_trait;

    struct SingleProfile {
        packages: Vec<&'static str>,
        broken: bool,
    }

    #[async_trait]
    impl PackageInventory for SingleProfile {
        async fn profiles(&self) -> Result<Vec<Profile>> {
            if self.broken {
                return Err(Error::Unavailable("package manager not responding".into()));
            }
            Ok(vec![Profile {
                id: 0,
                name: "Owner".into(),
                kind: ProfileKind::Personal,
            }])
        }

        async fn packages(&self, profile_id: u32) -> Result<Vec<InstalledPackage>> {
            Ok(self
                .packages
                .iter()
                .enumerate()
                .map(|(i, package)| InstalledPackage {
                    package: (*package).to_string(),
                    profile_id,
                    app_id: 10_100 + u32::try_from(i).unwrap_or_default(),
                    label: (*package).to_string(),
                    is_system: false,
                    has_internet: true,
                })
                .collect())
        }
    }

    async fn orchestrator(backends: &[Arc<FakeBackend>]) -> Orchestrator {
        let mut set = BackendSet::new();
        for b in backends {
            set = set.with(b.clone());
        }
        Orchestrator::new(
            set,
            Arc::new(RuleTable::in_memory()),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            AuditLog::disabled(),
        )
        .await
    }

    #[tokio::test]
    async fn test_auto_prefers_kernel() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel.clone(), vpn]).await;

        let plan = orch.plan_start(FirewallMode::Auto).await.unwrap();
        assert_eq!(plan.backend, BackendType::KernelRules);
        assert!(!plan.needs_vpn_consent);
        assert_eq!(orch.state(), FirewallState::Starting);

        orch.start(plan, Consent::NotRequired).await.unwrap();
        assert_eq!(orch.state(), FirewallState::Running(BackendType::KernelRules));
        assert_eq!(kernel.applies.load(Ordering::SeqCst), 1);
        assert!(orch.settings().get().await.enabled);
    }

    #[tokio::test]
    async fn test_forced_unavailable_reports_reason() {
        let kernel = FakeBackend::new(BackendType::KernelRules, false);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel, vpn]).await;

        let result = orch
            .plan_start(FirewallMode::Forced(BackendType::KernelRules))
            .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
        assert!(matches!(orch.state(), FirewallState::Error(_)));
    }

    #[tokio::test]
    async fn test_apply_failure_leaves_nothing_running() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        kernel.fail_apply.store(true, Ordering::SeqCst);
        let orch = orchestrator(&[kernel.clone()]).await;

        let plan = orch.plan_start(FirewallMode::Auto).await.unwrap();
        let result = orch.start(plan, Consent::NotRequired).await;
        assert!(matches!(result, Err(Error::ApplyFailed { .. })));
        assert!(!kernel.is_active());
        assert!(matches!(orch.state(), FirewallState::Error(_)));
        assert!(orch.snapshot().is_stopped());
        assert!(!orch.settings().get().await.enabled);
    }

    #[tokio::test]
    async fn test_consent_denied_stops() {
        let vpn = FakeBackend::build(BackendType::Vpn, true, true);
        let orch = orchestrator(&[vpn.clone()]).await;

        let plan = orch.plan_start(FirewallMode::Auto).await.unwrap();
        assert!(plan.needs_vpn_consent);
        let result = orch.start(plan, Consent::Denied).await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(orch.state(), FirewallState::Stopped);
        assert!(!vpn.is_active());

        let result = orch.start_with_mode(FirewallMode::Auto).await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_switch_is_make_before_break() {
        let kernel = FakeBackend::new(BackendType::KernelRules, false);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel.clone(), vpn.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();
        assert_eq!(orch.snapshot(), BackendSnapshot::running(BackendType::Vpn));

        kernel.available.store(true, Ordering::SeqCst);
        assert_eq!(orch.upgrade().await.unwrap(), Some(BackendType::KernelRules));
        assert!(kernel.is_active());
        assert!(!vpn.is_active());
        assert_eq!(
            orch.snapshot(),
            BackendSnapshot::running(BackendType::KernelRules)
        );
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_old_backend() {
        let kernel = FakeBackend::new(BackendType::KernelRules, false);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel.clone(), vpn.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        kernel.available.store(true, Ordering::SeqCst);
        kernel.fail_apply.store(true, Ordering::SeqCst);
        assert!(orch.switch_backend(BackendType::KernelRules).await.is_err());
        assert!(vpn.is_active());
        assert!(!kernel.is_active());
        assert_eq!(orch.snapshot(), BackendSnapshot::running(BackendType::Vpn));
        assert_eq!(orch.state(), FirewallState::Running(BackendType::Vpn));
    }

    #[tokio::test]
    async fn test_switch_after_stop_is_rejected() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel.clone(), vpn]).await;
        orch.start_with_mode(FirewallMode::Forced(BackendType::Vpn))
            .await
            .unwrap();
        orch.stop().await.unwrap();

        assert!(matches!(
            orch.switch_backend(BackendType::KernelRules).await,
            Err(Error::InvalidState(_))
        ));
        assert!(!kernel.is_active());
        assert!(!orch.settings().get().await.enabled);
    }

    #[tokio::test]
    async fn test_apply_mode() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = orchestrator(&[kernel, vpn]).await;

        assert_eq!(
            orch.apply_mode(FirewallMode::Forced(BackendType::Vpn))
                .await
                .unwrap(),
            ModeChange::Saved
        );
        orch.start_with_mode(FirewallMode::Forced(BackendType::Vpn))
            .await
            .unwrap();
        assert_eq!(
            orch.apply_mode(FirewallMode::Auto).await.unwrap(),
            ModeChange::Switched(BackendType::KernelRules)
        );
        assert_eq!(
            orch.apply_mode(FirewallMode::Forced(BackendType::KernelRules))
                .await
                .unwrap(),
            ModeChange::Unchanged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_burst_is_debounced() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let orch = orchestrator(&[kernel.clone()]).await;
        let store = orch.inner.store.clone();
        store
            .upsert(Rule::new("com.example", 0, 10_100, "Example"))
            .await
            .unwrap();
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();
        assert_eq!(kernel.applies.load(Ordering::SeqCst), 1);

        let (_tx, rx) = watch::channel(DeviceConditions::default());
        let events = orch.spawn_event_loop(rx);

        let key = RuleKey::new("com.example", 0);
        for i in 0..5 {
            store
                .update(&key, RuleChange::Wifi(i % 2 == 0))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(kernel.applies.load(Ordering::SeqCst), 2);
        events.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_change_reaches_backend() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let orch = orchestrator(&[kernel.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        orch.set_conditions(DeviceConditions {
            network: NetworkClass::Roaming,
            screen_on: false,
        });
        tokio::time::sleep(Duration::from_millis(350)).await;

        let ctx = kernel.last_ctx.lock().unwrap().unwrap();
        assert_eq!(ctx.network, NetworkClass::Roaming);
        assert!(!ctx.screen_on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconfigure() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let orch = orchestrator(&[kernel.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        orch.request_reconfigure();
        orch.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(kernel.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_mode_consent_then_complete_switch() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let vpn = FakeBackend::build(BackendType::Vpn, true, true);
        let orch = orchestrator(&[kernel.clone(), vpn.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        let change = orch
            .apply_mode(FirewallMode::Forced(BackendType::Vpn))
            .await
            .unwrap();
        let ModeChange::ConsentRequired(plan) = change else {
            panic!("expected ConsentRequired, got {change:?}");
        };
        assert_eq!(plan.backend, BackendType::Vpn);
        assert!(plan.needs_vpn_consent);
        assert_eq!(
            orch.settings().get().await.mode,
            FirewallMode::Forced(BackendType::Vpn)
        );
        // Nothing changes until the user answers
        assert!(kernel.is_active());
        assert!(!vpn.is_active());

        let denied = orch.complete_switch(plan, Consent::Denied).await;
        assert!(matches!(denied, Err(Error::PermissionDenied(_))));
        assert!(kernel.is_active());
        assert!(!vpn.is_active());
        assert_eq!(orch.state(), FirewallState::Running(BackendType::KernelRules));

        orch.complete_switch(plan, Consent::Granted).await.unwrap();
        assert!(vpn.is_active());
        assert!(!kernel.is_active());
        assert_eq!(orch.snapshot(), BackendSnapshot::running(BackendType::Vpn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_change_reapplies() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let orch = orchestrator(&[kernel.clone()]).await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();
        assert_eq!(
            kernel.last_ctx.lock().unwrap().unwrap().default_policy,
            DefaultPolicy::AllowAll
        );

        orch.set_default_policy(DefaultPolicy::BlockAll).await.unwrap();
        assert_eq!(
            orch.settings().get().await.default_policy,
            DefaultPolicy::BlockAll
        );
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(kernel.applies.load(Ordering::SeqCst), 2);
        assert_eq!(
            kernel.last_ctx.lock().unwrap().unwrap().default_policy,
            DefaultPolicy::BlockAll
        );
    }

    #[tokio::test]
    async fn test_default_policy_saved_while_stopped() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let orch = orchestrator(&[kernel.clone()]).await;

        orch.set_default_policy(DefaultPolicy::BlockAll).await.unwrap();
        assert_eq!(
            orch.settings().get().await.default_policy,
            DefaultPolicy::BlockAll
        );
        assert_eq!(kernel.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_installed_apps_get_rules_before_apply() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let store = Arc::new(RuleTable::in_memory());
        let mut known = Rule::new("com.known", 0, 10_100, "Known");
        known.apply_change(RuleChange::Wifi(true));
        store.upsert(known).await.unwrap();

        let orch = Orchestrator::with_inventory(
            BackendSet::new().with(kernel.clone()),
            store.clone(),
            Arc::new(SingleProfile {
                packages: vec!["com.known", "com.newapp"],
                broken: false,
            }),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            AuditLog::disabled(),
        )
        .await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        let added = store
            .get(&RuleKey::new("com.newapp", 0))
            .await
            .unwrap()
            .expect("installed app has a rule");
        // Inert, so the default policy decides
        assert!(!added.enabled);
        assert!(store.get(&RuleKey::new("com.known", 0)).await.unwrap().unwrap().wifi);
    }

    #[tokio::test]
    async fn test_inventory_failure_still_starts() {
        let kernel = FakeBackend::new(BackendType::KernelRules, true);
        let store = Arc::new(RuleTable::in_memory());
        let orch = Orchestrator::with_inventory(
            BackendSet::new().with(kernel.clone()),
            store.clone(),
            Arc::new(SingleProfile {
                packages: vec![],
                broken: true,
            }),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            AuditLog::disabled(),
        )
        .await;

        orch.start_with_mode(FirewallMode::Auto).await.unwrap();
        assert_eq!(orch.state(), FirewallState::Running(BackendType::KernelRules));
        assert!(store.all().await.unwrap().is_empty());
    }
}
