//! Rule evaluation
//!
//! [`is_blocked`] is the single source of truth for "should this app's
//! traffic be blocked right now". It is pure: no I/O, no clock, no globals.
//! Backends never re-implement the decision; they consume [`Verdict`]s.

use crate::core::rule::{DefaultPolicy, NetworkClass, Rule};
use serde::{Deserialize, Serialize};

/// Device conditions a rule set is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyContext {
    pub network: NetworkClass,
    pub screen_on: bool,
    pub default_policy: DefaultPolicy,
}

impl Default for ApplyContext {
    fn default() -> Self {
        Self {
            network: NetworkClass::None,
            screen_on: true,
            default_policy: DefaultPolicy::AllowAll,
        }
    }
}

/// Decides whether traffic for `rule` must be blocked.
///
/// An absent or disabled rule falls back to `default_policy`.
pub fn is_blocked(
    rule: Option<&Rule>,
    network: NetworkClass,
    screen_on: bool,
    default_policy: DefaultPolicy,
) -> bool {
    let Some(rule) = rule.filter(|r| r.enabled) else {
        return default_policy.blocks();
    };

    if !screen_on && rule.background {
        return true;
    }

    match network {
        NetworkClass::Wifi => rule.wifi,
        NetworkClass::Mobile => rule.mobile,
        NetworkClass::Roaming => rule.roaming || rule.mobile,
        NetworkClass::None => false,
    }
}

/// Whether LAN destinations must be rejected for an otherwise allowed app.
///
/// Only meaningful on Wi-Fi; on other networks LAN ranges are not reachable.
pub fn is_lan_blocked(rule: Option<&Rule>, ctx: &ApplyContext) -> bool {
    let Some(rule) = rule.filter(|r| r.enabled && r.lan) else {
        return false;
    };
    ctx.network == NetworkClass::Wifi
        && !is_blocked(Some(rule), ctx.network, ctx.screen_on, ctx.default_policy)
}

/// Evaluated decision for one rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verdict {
    pub uid: u32,
    pub package: String,
    pub profile_id: u32,
    pub blocked: bool,
    pub lan_blocked: bool,
}

/// Evaluates every network-capable rule, sorted by UID.
pub fn evaluate_all(rules: &[Rule], ctx: &ApplyContext) -> Vec<Verdict> {
    let mut verdicts: Vec<Verdict> = rules
        .iter()
        .filter(|r| r.has_internet)
        .map(|r| Verdict {
            uid: r.uid,
            package: r.package.clone(),
            profile_id: r.profile_id,
            blocked: is_blocked(Some(r), ctx.network, ctx.screen_on, ctx.default_policy),
            lan_blocked: is_lan_blocked(Some(r), ctx),
        })
        .collect();
    verdicts.sort_by_key(|v| v.uid);
    verdicts
}

/// Packages that may reach the network under `ctx` (the VPN bypass set).
pub fn allowed_packages(rules: &[Rule], ctx: &ApplyContext) -> Vec<String> {
    let mut packages: Vec<String> = evaluate_all(rules, ctx)
        .into_iter()
        .filter(|v| !v.blocked)
        .map(|v| v.package)
        .collect();
    packages.sort();
    packages.dedup();
    packages
}
