//! Broker network-policy backend for OS versions without the connectivity chain
//!
//! Blocked UIDs are added to the netpolicy background-restriction deny list.
//! That list only stops background traffic on metered networks, so a block
//! is enforceable only on mobile or roaming with the screen off (or with no
//! network at all). Any other blocked verdict makes `apply_rules` fail with
//! `ApplyFailed` naming the packages it could not enforce; the restrictions
//! it can express are still applied.

use super::{Backend, CONNECTIVITY_MIN_SDK, fingerprint, require_privilege};
use crate::core::error::{Error, Result};
use crate::core::evaluator::{ApplyContext, evaluate_all};
use crate::core::rule::{NetworkClass, Rule};
use crate::core::state::BackendType;
use crate::privilege::broker::BrokerChannel;
use crate::privilege::{PrivilegeKind, PrivilegeMonitor};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Applied {
    fingerprint: Option<String>,
    restricted: BTreeSet<u32>,
}

pub struct LegacyPolicyBackend {
    broker: Arc<dyn BrokerChannel>,
    monitor: PrivilegeMonitor,
    sdk: u32,
    applied: Mutex<Applied>,
    active: AtomicBool,
}

impl LegacyPolicyBackend {
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

fn apply_failed(e: Error) -> Error {
    match e {
        Error::PermissionDenied(_) | Error::Timeout { .. } | Error::ApplyFailed { .. } => e,
        other => Error::ApplyFailed {
            backend: BackendType::BrokerLegacyPolicy,
            message: other.to_string(),
        },
    }
}

/// Whether a blocked verdict under `ctx` is actually enforced by the
/// background-restriction list.
pub fn can_enforce_block(ctx: &ApplyContext) -> bool {
    match ctx.network {
        NetworkClass::Mobile | NetworkClass::Roaming => !ctx.screen_on,
        NetworkClass::None => true,
        NetworkClass::Wifi => false,
    }
}

#[async_trait]
impl Backend for LegacyPolicyBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::BrokerLegacyPolicy
    }

    fn supports_granular_control(&self) -> bool {
        false
    }

    async fn check_availability(&self) -> Result<()> {
        // Superseded by the connectivity chain on newer releases
        if self.sdk >= CONNECTIVITY_MIN_SDK {
            return Err(Error::VersionUnsupported {
                required: CONNECTIVITY_MIN_SDK - 1,
                found: self.sdk,
            });
        }
        require_privilege(PrivilegeKind::Broker, self.monitor.status())
    }

    async fn start(&self) -> Result<()> {
        self.check_availability().await?;
        self.active.store(true, Ordering::SeqCst);
        info!("Legacy policy backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        let mut first_error = None;
        for uid in std::mem::take(&mut applied.restricted) {
            if let Err(e) = self.broker.set_uid_restricted(uid, false).await {
                warn!("Failed to lift restriction on uid {}: {}", uid, e);
                first_error.get_or_insert(e);
            }
        }
        applied.fingerprint = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Legacy policy backend stopped");
        first_error.map_or(Ok(()), Err)
    }

    async fn apply_rules(&self, rules: &[Rule], ctx: &ApplyContext) -> Result<()> {
        let blocked: Vec<_> = evaluate_all(rules, ctx)
            .into_iter()
            .filter(|v| v.blocked)
            .collect();
        let desired: BTreeSet<u32> = blocked.iter().map(|v| v.uid).collect();
        let mut unenforced: Vec<String> = if can_enforce_block(ctx) {
            Vec::new()
        } else {
            blocked.into_iter().map(|v| v.package).collect()
        };
        unenforced.sort();
        unenforced.dedup();
        let digest = fingerprint(&desired)?;

        let mut applied = self.applied.lock().await;
        if applied.fingerprint.as_deref() == Some(digest.as_str()) {
            debug!("Restricted UID set unchanged, skipping apply");
            return Ok(());
        }

        let to_lift: Vec<u32> = applied.restricted.difference(&desired).copied().collect();
        let to_add: Vec<u32> = desired.difference(&applied.restricted).copied().collect();

        for uid in to_add {
            self.broker
                .set_uid_restricted(uid, true)
                .await
                .map_err(apply_failed)?;
            applied.restricted.insert(uid);
        }
        for uid in to_lift {
            self.broker
                .set_uid_restricted(uid, false)
                .await
                .map_err(apply_failed)?;
            applied.restricted.remove(&uid);
        }

        if !unenforced.is_empty() {
            // Leave the fingerprint unset so the next apply reports this again
            applied.fingerprint = None;
            warn!(
                "Network policy cannot block {} packages on {} with the screen {}",
                unenforced.len(),
                ctx.network,
                if ctx.screen_on { "on" } else { "off" }
            );
            return Err(Error::ApplyFailed {
                backend: BackendType::BrokerLegacyPolicy,
                message: format!(
                    "background restriction cannot block foreground or {} traffic for: {}",
                    ctx.network,
                    unenforced.join(", ")
                ),
            });
        }

        applied.fingerprint = Some(digest);
        info!(
            "Applied network policy: {} UIDs restricted",
            applied.restricted.len()
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
