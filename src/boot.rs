//! Boot restore
//!
//! Called once after the device starts. Re-establishes the firewall if it was
//! enabled before the restart, using the same start sequence as a manual
//! start, then lifts the boot-time kernel policy when the kernel backend
//! took over.

use crate::audit::EventType;
use crate::core::error::Result;
use crate::core::state::BackendType;
use crate::orchestrator::{Consent, Orchestrator, StartPlan};
use crate::privilege::PrivilegeMonitor;
use crate::upgrade::should_start;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BootOutcome {
    /// The firewall was off before the restart
    Skipped,
    /// The selected backend needs VPN consent, which needs the UI
    ConsentRequired { plan: StartPlan },
    Restored {
        backend: BackendType,
        /// Boot-time kernel policy was lifted
        normalized: bool,
        /// Running on the fallback backend; start the upgrade monitor
        start_upgrade_monitor: bool,
    },
}

/// Restores the firewall after a device restart.
///
/// # Errors
///
/// Returns the start error verbatim; the firewall is left stopped.
pub async fn restore_on_boot(
    orchestrator: &Orchestrator,
    root: &PrivilegeMonitor,
    broker: &PrivilegeMonitor,
) -> Result<BootOutcome> {
    let settings = orchestrator.settings().get().await;
    if !settings.enabled {
        info!("Firewall was disabled before restart, nothing to restore");
        return Ok(BootOutcome::Skipped);
    }

    let settle = settings.boot_settle();
    let probes = async { tokio::join!(root.recheck(), broker.recheck()) };
    match tokio::time::timeout(settle, probes).await {
        Ok((root_status, broker_status)) => {
            info!(
                "Privileges after boot: root {}, broker {}",
                root_status, broker_status
            );
        }
        Err(_) => warn!(
            "Privilege sources did not settle within {:?}, starting with what is known",
            settle
        ),
    }

    let plan = match orchestrator.plan_start(settings.mode).await {
        Ok(plan) => plan,
        Err(e) => {
            record(orchestrator, false, None, Some(e.to_string())).await;
            return Err(e);
        }
    };
    if plan.needs_vpn_consent {
        info!("VPN consent needed, boot restore deferred to the app");
        orchestrator.abandon(plan);
        return Ok(BootOutcome::ConsentRequired { plan });
    }

    let backend = match orchestrator
        .start(plan, Consent::NotRequired)
        .await
    {
        Ok(backend) => backend,
        Err(e) => {
            record(orchestrator, false, Some(plan.backend), Some(e.to_string())).await;
            return Err(e);
        }
    };

    let normalized = if backend == BackendType::KernelRules && settings.boot_protection {
        match orchestrator.normalize_boot_policy().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to lift boot-time policy: {}", e);
                false
            }
        }
    } else {
        false
    };

    record(orchestrator, true, Some(backend), None).await;
    Ok(BootOutcome::Restored {
        backend,
        normalized,
        start_upgrade_monitor: should_start(
            orchestrator.snapshot(),
            settings.mode,
            broker.status(),
        ),
    })
}

async fn record(
    orchestrator: &Orchestrator,
    success: bool,
    backend: Option<BackendType>,
    error: Option<String>,
) {
    orchestrator
        .audit()
        .record(
            EventType::BootRestore,
            success,
            serde_json::json!({ "backend": backend }),
            error,
        )
        .await;
}
