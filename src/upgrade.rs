//! Backend upgrade monitor
//!
//! After a cold start that had to fall back to the VPN backend in AUTO mode,
//! this task waits for the broker to become usable and then switches the
//! firewall to the better backend exactly once.
//!
//! Phases: `Idle → Waiting → Switching → Done | TimedOut | Cancelled`.
//!
//! The monitor keeps running while [`keep_running`] holds for the orchestrator's
//! [`BackendSnapshot`]. Both halves of that predicate come from one published
//! value, so a switch in flight (no active backend, `switching` set) is never
//! mistaken for a stopped firewall.

use crate::core::state::{BackendSnapshot, BackendType, FirewallMode};
use crate::orchestrator::Orchestrator;
use crate::privilege::{PrivilegeMonitor, PrivilegeStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the success notice stays up before the monitor exits
pub const SUCCESS_LINGER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UpgradePhase {
    Idle,
    /// Degraded notice posted, waiting for the broker
    Waiting,
    Switching,
    Done,
    /// The broker never became usable
    TimedOut,
    Cancelled,
}

impl UpgradePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpgradePhase::Done | UpgradePhase::TimedOut | UpgradePhase::Cancelled
        )
    }
}

/// Whether a monitor should be started after a start sequence.
pub fn should_start(
    snapshot: BackendSnapshot,
    mode: FirewallMode,
    broker: PrivilegeStatus,
) -> bool {
    snapshot.active == Some(BackendType::Vpn) && mode.is_auto() && !broker.is_granted()
}

/// Single predicate over the combined snapshot.
pub fn keep_running(snapshot: BackendSnapshot) -> bool {
    snapshot.switching || snapshot.active == Some(BackendType::Vpn)
}

/// User-facing notices posted by the monitor
pub trait Notifier: Send + Sync {
    /// Persistent, dismissible notice with a retry action.
    fn degraded(&self, current: BackendType);

    /// Transient notice after a successful switch.
    fn upgraded(&self, backend: BackendType);

    /// Persistent notice with a retry action.
    fn upgrade_failed(&self, reason: &str);

    /// Removes whatever notice is showing.
    fn dismiss(&self);
}

/// Notifier that only writes to the log (CLI and headless hosts)
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn degraded(&self, current: BackendType) {
        warn!(
            "Firewall running on {} until the broker is ready",
            current.display_name()
        );
    }

    fn upgraded(&self, backend: BackendType) {
        info!("Firewall upgraded to {}", backend.display_name());
    }

    fn upgrade_failed(&self, reason: &str) {
        warn!("Backend upgrade failed: {}", reason);
    }

    fn dismiss(&self) {}
}

struct Shared {
    phase: watch::Sender<UpgradePhase>,
    retry: Notify,
    cancel: Notify,
    attempting: AtomicBool,
}

impl Shared {
    fn set_phase(&self, phase: UpgradePhase) {
        debug!("Upgrade monitor phase: {}", phase);
        self.phase.send_replace(phase);
    }
}

/// Control handle for a running monitor
pub struct UpgradeHandle {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl UpgradeHandle {
    pub fn phase(&self) -> UpgradePhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpgradePhase> {
        self.shared.phase.subscribe()
    }

    /// Manual retry from the notice. Ignored while an attempt is running.
    pub fn retry(&self) {
        if self.shared.attempting.load(Ordering::SeqCst) {
            debug!("Upgrade attempt already running, retry ignored");
            return;
        }
        self.shared.retry.notify_one();
    }

    pub fn cancel(&self) {
        self.shared.cancel.notify_one();
    }

    /// Waits for the monitor to exit and returns its final phase.
    pub async fn join(self) -> UpgradePhase {
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            warn!("Upgrade monitor task failed: {}", e);
        }
        *self.shared.phase.borrow()
    }
}

/// Outcome of one switch attempt
enum Attempt {
    Upgraded(BackendType),
    NothingBetter,
    Failed(String),
    Busy,
}

pub struct UpgradeMonitor {
    orchestrator: Orchestrator,
    broker: PrivilegeMonitor,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    linger: Duration,
}

impl UpgradeMonitor {
    pub fn new(
        orchestrator: Orchestrator,
        broker: PrivilegeMonitor,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            broker,
            notifier,
            timeout,
            linger: SUCCESS_LINGER,
        }
    }

    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Spawns the monitor if [`should_start`] holds for the current state.
    pub async fn spawn_if_needed(self) -> Option<UpgradeHandle> {
        let mode = self.orchestrator.settings().get().await.mode;
        if should_start(self.orchestrator.snapshot(), mode, self.broker.status()) {
            Some(self.spawn())
        } else {
            None
        }
    }

    pub fn spawn(self) -> UpgradeHandle {
        let shared = Arc::new(Shared {
            phase: watch::Sender::new(UpgradePhase::Idle),
            retry: Notify::new(),
            cancel: Notify::new(),
            attempting: AtomicBool::new(false),
        });
        // Subscribe before the task runs so no transition is missed
        let snapshots = self.orchestrator.subscribe_backend();
        let broker = self.broker.subscribe();
        let task = tokio::spawn(self.run(shared.clone(), snapshots, broker));
        UpgradeHandle { shared, task }
    }

    async fn run(
        self,
        shared: Arc<Shared>,
        mut snapshots: watch::Receiver<BackendSnapshot>,
        mut broker: watch::Receiver<PrivilegeStatus>,
    ) {
        if !keep_running(*snapshots.borrow_and_update()) {
            shared.set_phase(UpgradePhase::Done);
            return;
        }

        shared.set_phase(UpgradePhase::Waiting);
        self.notifier.degraded(BackendType::Vpn);
        info!(
            "Upgrade monitor waiting up to {:?} for the broker",
            self.timeout
        );

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        // The timeout only covers a broker that never shows up
        let mut broker_seen = broker.borrow_and_update().is_granted();
        let mut immediate = broker_seen.then_some("broker already ready");

        let final_phase = loop {
            let trigger = if let Some(trigger) = immediate.take() {
                trigger
            } else {
                tokio::select! {
                    biased;
                    () = shared.cancel.notified() => break UpgradePhase::Cancelled,
                    changed = snapshots.changed() => {
                        if changed.is_err() || !keep_running(*snapshots.borrow_and_update()) {
                            debug!("Firewall no longer on VPN, upgrade monitor exiting");
                            break UpgradePhase::Done;
                        }
                        continue;
                    }
                    () = &mut deadline, if !broker_seen => break UpgradePhase::TimedOut,
                    changed = broker.changed() => {
                        if changed.is_err() {
                            break UpgradePhase::Cancelled;
                        }
                        let status = *broker.borrow_and_update();
                        if !status.is_granted() {
                            continue;
                        }
                        broker_seen = true;
                        "broker ready"
                    }
                    () = shared.retry.notified() => {
                        self.broker.recheck().await;
                        "manual retry"
                    }
                }
            };

            info!("Attempting backend upgrade ({})", trigger);
            match self.attempt(&shared).await {
                Attempt::Upgraded(backend) => {
                    self.notifier.upgraded(backend);
                    tokio::time::sleep(self.linger).await;
                    break UpgradePhase::Done;
                }
                Attempt::NothingBetter => {
                    shared.set_phase(UpgradePhase::Waiting);
                }
                Attempt::Failed(reason) => {
                    self.notifier.upgrade_failed(&reason);
                    shared.set_phase(UpgradePhase::Waiting);
                }
                Attempt::Busy => {}
            }
        };

        if final_phase == UpgradePhase::TimedOut {
            warn!("Broker did not become available in {:?}", self.timeout);
        }
        self.notifier.dismiss();
        shared.set_phase(final_phase);
    }

    async fn attempt(&self, shared: &Shared) -> Attempt {
        if shared
            .attempting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Attempt::Busy;
        }
        shared.set_phase(UpgradePhase::Switching);

        let outcome = match self.orchestrator.upgrade().await {
            Ok(Some(backend)) => Attempt::Upgraded(backend),
            Ok(None) => {
                debug!("No better backend available yet");
                Attempt::NothingBetter
            }
            Err(e) => Attempt::Failed(e.translate().user_message),
        };
        shared.attempting.store(false, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::backend::{Backend, BackendSet};
    use crate::backend::testing::FakeBackend;
    use crate::config::{Settings, SettingsStore};
    use crate::core::store::RuleTable;
    use crate::privilege::PrivilegeKind;
    use crate::privilege::testing::FixedSource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<String>>);

    impl RecordingNotifier {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn degraded(&self, current: BackendType) {
            self.0.lock().unwrap().push(format!("degraded:{current}"));
        }

        fn upgraded(&self, backend: BackendType) {
            self.0.lock().unwrap().push(format!("upgraded:{backend}"));
        }

        fn upgrade_failed(&self, _reason: &str) {
            self.0.lock().unwrap().push("failed".to_string());
        }

        fn dismiss(&self) {
            self.0.lock().unwrap().push("dismiss".to_string());
        }
    }

    struct Fixture {
        orch: Orchestrator,
        connectivity: Arc<FakeBackend>,
        source: Arc<FixedSource>,
        broker: PrivilegeMonitor,
        notifier: Arc<RecordingNotifier>,
    }

    async fn fixture() -> Fixture {
        let connectivity = FakeBackend::new(BackendType::BrokerConnectivity, false);
        let vpn = FakeBackend::new(BackendType::Vpn, true);
        let orch = Orchestrator::new(
            BackendSet::new().with(connectivity.clone()).with(vpn),
            Arc::new(RuleTable::in_memory()),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            AuditLog::disabled(),
        )
        .await;
        orch.start_with_mode(FirewallMode::Auto).await.unwrap();

        let source = FixedSource::new(PrivilegeKind::Broker, PrivilegeStatus::Unavailable);
        let broker = PrivilegeMonitor::new(source.clone(), Duration::from_secs(5));
        broker.recheck().await;

        Fixture {
            orch,
            connectivity,
            source,
            broker,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn monitor(f: &Fixture) -> UpgradeMonitor {
        UpgradeMonitor::new(
            f.orch.clone(),
            f.broker.clone(),
            f.notifier.clone(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_should_start() {
        let vpn = BackendSnapshot::running(BackendType::Vpn);
        assert!(should_start(vpn, FirewallMode::Auto, PrivilegeStatus::Checking));
        assert!(should_start(
            vpn,
            FirewallMode::Auto,
            PrivilegeStatus::InstalledNotRunning
        ));
        assert!(!should_start(
            vpn,
            FirewallMode::Auto,
            PrivilegeStatus::AvailableWithPermission
        ));
        assert!(!should_start(
            vpn,
            FirewallMode::Forced(BackendType::Vpn),
            PrivilegeStatus::Unavailable
        ));
        assert!(!should_start(
            BackendSnapshot::running(BackendType::KernelRules),
            FirewallMode::Auto,
            PrivilegeStatus::Unavailable
        ));
    }

    #[test]
    fn test_keep_running_during_switch() {
        assert!(keep_running(BackendSnapshot::running(BackendType::Vpn)));
        assert!(keep_running(BackendSnapshot::SWITCHING));
        assert!(!keep_running(BackendSnapshot::STOPPED));
        assert!(!keep_running(BackendSnapshot::running(
            BackendType::BrokerConnectivity
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_timeout() {
        let f = fixture().await;
        let handle = monitor(&f).spawn_if_needed().await.unwrap();

        assert_eq!(handle.join().await, UpgradePhase::TimedOut);
        assert_eq!(f.notifier.events(), vec!["degraded:vpn", "dismiss"]);
        assert_eq!(f.orch.snapshot(), BackendSnapshot::running(BackendType::Vpn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrades_when_broker_appears() {
        let f = fixture().await;
        let handle = monitor(&f).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.phase(), UpgradePhase::Waiting);

        f.connectivity.available.store(true, Ordering::SeqCst);
        f.source.set(PrivilegeStatus::AvailableWithPermission);
        f.broker.recheck().await;

        assert_eq!(handle.join().await, UpgradePhase::Done);
        assert_eq!(
            f.orch.snapshot(),
            BackendSnapshot::running(BackendType::BrokerConnectivity)
        );
        assert_eq!(
            f.notifier.events(),
            vec!["degraded:vpn", "upgraded:broker-connectivity", "dismiss"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_ready_before_task_runs_still_upgrades() {
        let f = fixture().await;
        let handle = monitor(&f).spawn_if_needed().await.unwrap();

        // The broker turns ready before the monitor task is first polled
        f.connectivity.available.store(true, Ordering::SeqCst);
        f.source.set(PrivilegeStatus::AvailableWithPermission);
        f.broker.recheck().await;

        assert_eq!(handle.join().await, UpgradePhase::Done);
        assert_eq!(
            f.orch.snapshot(),
            BackendSnapshot::running(BackendType::BrokerConnectivity)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_ready_at_spawn_upgrades_immediately() {
        let f = fixture().await;
        f.connectivity.available.store(true, Ordering::SeqCst);
        f.source.set(PrivilegeStatus::AvailableWithPermission);
        f.broker.recheck().await;

        let handle = monitor(&f).with_linger(Duration::ZERO).spawn();
        let started = tokio::time::Instant::now();
        assert_eq!(handle.join().await, UpgradePhase::Done);
        assert!(started.elapsed() < Duration::from_secs(300));
        assert_eq!(
            f.orch.snapshot(),
            BackendSnapshot::running(BackendType::BrokerConnectivity)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_manual_retry() {
        let f = fixture().await;
        let handle = monitor(&f).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;

        f.connectivity.available.store(true, Ordering::SeqCst);
        f.connectivity.fail_apply.store(true, Ordering::SeqCst);
        f.source.set(PrivilegeStatus::AvailableWithPermission);
        f.broker.recheck().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handle.phase(), UpgradePhase::Waiting);
        assert_eq!(f.orch.snapshot(), BackendSnapshot::running(BackendType::Vpn));

        f.connectivity.fail_apply.store(false, Ordering::SeqCst);
        handle.retry();
        assert_eq!(handle.join().await, UpgradePhase::Done);
        assert_eq!(
            f.notifier.events(),
            vec![
                "degraded:vpn",
                "failed",
                "upgraded:broker-connectivity",
                "dismiss"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_stop_ends_monitor() {
        let f = fixture().await;
        let handle = monitor(&f).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;

        f.orch.stop().await.unwrap();
        assert_eq!(handle.join().await, UpgradePhase::Done);
        assert!(!f.connectivity.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let f = fixture().await;
        let handle = monitor(&f).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;

        handle.cancel();
        assert_eq!(handle.join().await, UpgradePhase::Cancelled);
    }
}
