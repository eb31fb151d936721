//! appwall - per-application firewall control plane
//!
//! Decides, per installed application and user profile, whether network
//! traffic is blocked, and enforces that through whichever mechanism the
//! device allows.
//!
//! # Architecture
//!
//! - [`core`] - Rules, evaluation, lifecycle state and the rule store
//! - [`privilege`] - Root and broker availability monitors
//! - [`backend`] - The four enforcement backends (VPN, iptables, connectivity chain, network policy)
//! - [`orchestrator`] - Backend selection, start/stop, atomic switching and reconfigure
//! - [`upgrade`] - Background upgrade from the VPN fallback once the broker is ready
//! - [`boot`] - Restoring the firewall after a device restart
//! - [`device`] - Network class, screen state and OS version
//! - [`audit`] - Event log for all privileged operations
//! - [`shell`] - Privileged command execution with timeouts
//! - [`validators`] - Input validation before anything reaches a privileged shell
//! - [`config`] - Settings persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - `Running` is published only after the backend started and the first rule set applied
//! - Make-before-break backend switches; the old backend keeps enforcing on failure
//! - A VPN owned by another app is never evicted
//! - SHA-256 fingerprints skip redundant privileged calls
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod backend;
pub mod boot;
pub mod config;
pub mod core;
pub mod device;
pub mod orchestrator;
pub mod privilege;
pub mod shell;
pub mod upgrade;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::evaluator::{ApplyContext, is_blocked};
pub use core::rule::{DefaultPolicy, NetworkClass, Rule, RuleChange, RuleKey};
pub use core::state::{BackendSnapshot, BackendType, FirewallMode, FirewallState};
pub use orchestrator::{Consent, Orchestrator, StartPlan};
