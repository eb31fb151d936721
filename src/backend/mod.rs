//! Enforcement backends
//!
//! Each backend wraps exactly one blocking mechanism:
//!
//! - [`vpn`]: local VPN that routes blocked apps into a tunnel with no forwarding
//! - [`kernel`]: iptables owner-match rules through the root shell
//! - [`connectivity`]: connectivity firewall chain through the broker (SDK 34+)
//! - [`legacy_policy`]: network policy deny list through the broker (below SDK 34)
//!
//! All operations are idempotent. Re-applying a verdict set whose
//! fingerprint matches the last successful apply is a no-op, since network
//! and screen changes trigger frequent re-application.

pub mod connectivity;
pub mod kernel;
pub mod legacy_policy;
pub mod vpn;

use crate::core::error::{Error, Result};
use crate::core::evaluator::ApplyContext;
use crate::core::rule::Rule;
use crate::core::state::BackendType;
use crate::privilege::{PrivilegeKind, PrivilegeStatus};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// First SDK level with the connectivity firewall chain commands
pub const CONNECTIVITY_MIN_SDK: u32 = 34;

#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Whether per-network-class decisions can be enforced (false only for VPN).
    fn supports_granular_control(&self) -> bool {
        true
    }

    /// Fails fast with a typed reason when the backend cannot be used right now.
    async fn check_availability(&self) -> Result<()>;

    /// Whether starting requires a one-time OS consent prompt first.
    async fn needs_consent(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn apply_rules(&self, rules: &[Rule], ctx: &ApplyContext) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Lifts any boot-time blocking policy once real rules are in place.
    async fn normalize_boot_policy(&self) -> Result<()> {
        Ok(())
    }
}

/// SHA-256 of the canonical JSON form of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Maps a privilege status onto the availability error a backend reports.
pub fn require_privilege(kind: PrivilegeKind, status: PrivilegeStatus) -> Result<()> {
    match status {
        PrivilegeStatus::AvailableWithPermission => Ok(()),
        PrivilegeStatus::Unavailable => Err(Error::Unavailable(format!("{kind} not available"))),
        PrivilegeStatus::InstalledNotRunning => {
            Err(Error::Unavailable(format!("{kind} installed but not running")))
        }
        PrivilegeStatus::AvailableNoPermission => Err(Error::PermissionDenied(format!(
            "{kind} access not granted"
        ))),
        PrivilegeStatus::Checking => Err(Error::Unavailable(format!(
            "{kind} status not determined yet"
        ))),
    }
}

/// The backends known to an orchestrator, keyed by type.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<BackendType, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend`, replacing any previous one of the same type.
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.backend_type(), backend);
        self
    }

    pub fn get(&self, backend_type: BackendType) -> Option<Arc<dyn Backend>> {
        self.backends.get(&backend_type).cloned()
    }

    pub fn types(&self) -> impl Iterator<Item = BackendType> + '_ {
        self.backends.keys().copied()
    }
}
