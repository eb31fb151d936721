//! Privilege detection
//!
//! Two independent privilege sources gate which backends are usable:
//!
//! - [`root`]: full privileged command execution through `su`
//! - [`broker`]: a broker-mediated privileged API channel (Shizuku-style)
//!
//! Each source is probed through the [`PrivilegeSource`] trait and observed
//! through a [`PrivilegeMonitor`], which owns a `watch` channel, bounds every
//! probe with a timeout and can re-check periodically.

pub mod broker;
pub mod root;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Availability of one privilege source
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrivilegeStatus {
    /// No probe has completed yet
    #[default]
    Checking,
    /// Mechanism not present (no `su`, broker not installed)
    Unavailable,
    /// Broker installed but its service is not running (broker only)
    InstalledNotRunning,
    /// Present but this app has no grant, or the prompt was denied / timed out
    AvailableNoPermission,
    /// Usable
    AvailableWithPermission,
}

impl PrivilegeStatus {
    pub fn is_granted(self) -> bool {
        matches!(self, PrivilegeStatus::AvailableWithPermission)
    }

    /// Whether a probe has produced a definite answer.
    pub fn is_settled(self) -> bool {
        !matches!(self, PrivilegeStatus::Checking)
    }

    /// The UI action that would move this source towards `AvailableWithPermission`.
    pub fn corrective_action(self) -> Option<CorrectiveAction> {
        match self {
            PrivilegeStatus::Unavailable => Some(CorrectiveAction::Install),
            PrivilegeStatus::InstalledNotRunning => Some(CorrectiveAction::Launch),
            PrivilegeStatus::AvailableNoPermission => Some(CorrectiveAction::Grant),
            PrivilegeStatus::Checking | PrivilegeStatus::AvailableWithPermission => None,
        }
    }
}

/// What the user has to do to unlock a privilege source
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CorrectiveAction {
    #[strum(serialize = "install")]
    Install,
    #[strum(serialize = "launch")]
    Launch,
    #[strum(serialize = "grant")]
    Grant,
}

/// Which privilege source a monitor watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PrivilegeKind {
    #[strum(serialize = "root")]
    Root,
    #[strum(serialize = "broker")]
    Broker,
}

/// Probe for one privilege source, injected so core logic runs against fakes.
#[async_trait]
pub trait PrivilegeSource: Send + Sync {
    fn kind(&self) -> PrivilegeKind;

    /// Determines the current status. May be slow; callers bound it with a timeout.
    async fn probe(&self) -> PrivilegeStatus;
}

/// Observable status of one privilege source
#[derive(Clone)]
pub struct PrivilegeMonitor {
    source: Arc<dyn PrivilegeSource>,
    status: Arc<watch::Sender<PrivilegeStatus>>,
    timeout: Duration,
}

impl PrivilegeMonitor {
    pub fn new(source: Arc<dyn PrivilegeSource>, timeout: Duration) -> Self {
        Self {
            source,
            status: Arc::new(watch::Sender::new(PrivilegeStatus::Checking)),
            timeout,
        }
    }

    pub fn kind(&self) -> PrivilegeKind {
        self.source.kind()
    }

    /// Last published status.
    pub fn status(&self) -> PrivilegeStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrivilegeStatus> {
        self.status.subscribe()
    }

    /// Re-probes the source and publishes the result.
    ///
    /// A probe that exceeds the timeout is classified as
    /// `AvailableNoPermission` (typically a root prompt nobody answered).
    pub async fn recheck(&self) -> PrivilegeStatus {
        let status = match tokio::time::timeout(self.timeout, self.source.probe()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "{} probe timed out after {:?}, treating as no permission",
                    self.kind(),
                    self.timeout
                );
                PrivilegeStatus::AvailableNoPermission
            }
        };

        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("{} privilege status: {}", self.kind(), status);
        } else {
            debug!("{} privilege status unchanged: {}", self.kind(), status);
        }
        status
    }

    /// Waits until the status is settled or `limit` elapses; returns the last status.
    pub async fn wait_settled(&self, limit: Duration) -> PrivilegeStatus {
        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(limit, rx.wait_for(|s| s.is_settled())).await;
        match settled {
            Ok(Ok(status)) => *status,
            _ => self.status(),
        }
    }

    /// Re-checks every `interval` until the returned handle is aborted.
    ///
    /// OS lifecycle callbacks (app resume, boot) call [`Self::recheck`] directly.
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.recheck().await;
            }
        })
    }
}
