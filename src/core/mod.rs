//! Core firewall types and logic
//!
//! Everything here is independent of how blocking is enforced:
//!
//! - [`error`]: Error taxonomy shared by every module
//! - [`state`]: Firewall lifecycle state, backend identity and selection mode
//! - [`rule`]: Per-app, per-profile rules and their invariants
//! - [`evaluator`]: The pure block/allow decision
//! - [`store`]: Durable rule table with change notifications
//! - [`inventory`]: Installed packages and profiles, and rule reconciliation

pub mod error;
pub mod evaluator;
pub mod inventory;
pub mod rule;
pub mod state;
pub mod store;
