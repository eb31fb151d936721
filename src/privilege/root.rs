//! Root privilege probe
//!
//! Runs `id` through the root shell and classifies the answer:
//!
//! - `uid=0(...)` in the output → `AvailableWithPermission`
//! - `su` binary missing → `Unavailable`
//! - denied, failed or timed out → `AvailableNoPermission`

use super::{PrivilegeKind, PrivilegeSource, PrivilegeStatus};
use crate::core::error::Error;
use crate::shell::RootShell;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct RootProbe {
    shell: Arc<dyn RootShell>,
    timeout: Duration,
}

impl RootProbe {
    pub fn new(shell: Arc<dyn RootShell>, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

/// Whether `id` output reports uid 0.
fn reports_root(stdout: &str) -> bool {
    stdout
        .split_whitespace()
        .any(|field| field == "uid=0" || field.starts_with("uid=0("))
}

#[async_trait]
impl PrivilegeSource for RootProbe {
    fn kind(&self) -> PrivilegeKind {
        PrivilegeKind::Root
    }

    async fn probe(&self) -> PrivilegeStatus {
        if !self.shell.is_present() {
            return PrivilegeStatus::Unavailable;
        }

        match self.shell.exec("id\n", self.timeout).await {
            Ok(output) if output.success() && reports_root(&output.stdout) => {
                PrivilegeStatus::AvailableWithPermission
            }
            Ok(output) => {
                debug!(
                    "Root probe refused (exit {:?}): {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                PrivilegeStatus::AvailableNoPermission
            }
            Err(Error::Unavailable(msg)) => {
                debug!("Root probe: {}", msg);
                PrivilegeStatus::Unavailable
            }
            Err(e) => {
                debug!("Root probe failed: {}", e);
                PrivilegeStatus::AvailableNoPermission
            }
        }
    }
}
