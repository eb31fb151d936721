//! Installed-package inventory
//!
//! The inventory is read-only input: which profiles exist and which
//! network-capable packages are installed in each. [`reconcile`] folds it
//! into the rule store so every installed app has exactly one rule per
//! profile and uninstalled apps lose theirs.

use crate::core::error::{Error, Result};
use crate::core::rule::{
    FIRST_APPLICATION_UID, LAST_APPLICATION_UID, PER_USER_RANGE, Rule, RuleKey,
};
use crate::core::store::RuleStore;
use crate::shell::run_with_timeout;
use crate::validators::{validate_package_name, validate_profile_id};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kind of OS user space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProfileKind {
    Personal,
    Work,
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: u32,
    pub name: String,
    pub kind: ProfileKind,
}

/// One installed package in one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPackage {
    pub package: String,
    pub profile_id: u32,
    /// Per-profile application id (`uid % 100000`)
    pub app_id: u32,
    pub label: String,
    pub is_system: bool,
    pub has_internet: bool,
}

#[async_trait]
pub trait PackageInventory: Send + Sync {
    async fn profiles(&self) -> Result<Vec<Profile>>;
    async fn packages(&self, profile_id: u32) -> Result<Vec<InstalledPackage>>;
}

/// Inventory read from the package manager CLI (`pm list ...`)
#[derive(Debug, Clone)]
pub struct ShellInventory {
    program: String,
    timeout: Duration,
}

impl ShellInventory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "pm".to_string(),
            timeout,
        }
    }

    async fn pm(&self, args: &[&str]) -> Result<String> {
        let output = run_with_timeout(&self.program, args, None, self.timeout, "pm list")
            .await?
            .check(Error::Unavailable)?;
        Ok(output.stdout)
    }
}

/// FLAG_MANAGED_PROFILE from the user manager
const FLAG_MANAGED_PROFILE: u32 = 0x20;

/// Parses `pm list users` output (`UserInfo{0:Owner:c13} running`).
pub fn parse_users(output: &str) -> Vec<Profile> {
    output
        .lines()
        .filter_map(|line| {
            let start = line.find("UserInfo{")? + "UserInfo{".len();
            let end = start + line[start..].find('}')?;
            let mut fields = line[start..end].split(':');
            let id = fields.next()?.trim().parse::<u32>().ok()?;
            let name = fields.next().unwrap_or_default().to_string();
            let flags = fields
                .next()
                .and_then(|f| u32::from_str_radix(f.trim(), 16).ok())
                .unwrap_or(0);

            let lower = name.to_lowercase();
            let kind = if flags & FLAG_MANAGED_PROFILE != 0 || lower.contains("work") {
                ProfileKind::Work
            } else if lower.contains("clone") || lower.contains("dual") {
                ProfileKind::Clone
            } else {
                ProfileKind::Personal
            };
            Some(Profile { id, name, kind })
        })
        .collect()
}

/// Parses `pm list packages -U` output (`package:com.example uid:10123`).
///
/// Returns `(package, app_id)` pairs; entries with unsafe names or
/// non-application UIDs are skipped.
pub fn parse_packages(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("package:")?;
            let mut parts = rest.split_whitespace();
            let package = parts.next()?;
            let uid = parts
                .find_map(|p| p.strip_prefix("uid:"))?
                .split(',')
                .find_map(|u| u.parse::<u32>().ok())?;
            let app_id = uid % PER_USER_RANGE;

            if validate_package_name(package).is_err() {
                warn!("Skipping package with unsafe name: {:?}", package);
                return None;
            }
            if !(FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app_id) {
                return None;
            }
            Some((package.to_string(), app_id))
        })
        .collect()
}

#[async_trait]
impl PackageInventory for ShellInventory {
    async fn profiles(&self) -> Result<Vec<Profile>> {
        let users = parse_users(&self.pm(&["list", "users"]).await?);
        if users.is_empty() {
            return Err(Error::Unavailable("pm returned no users".to_string()));
        }
        Ok(users)
    }

    async fn packages(&self, profile_id: u32) -> Result<Vec<InstalledPackage>> {
        let profile_id = validate_profile_id(profile_id).map_err(Error::Internal)?;
        let user = profile_id.to_string();

        let all = self
            .pm(&["list", "packages", "-U", "--user", &user])
            .await?;
        let system: BTreeSet<String> = self
            .pm(&["list", "packages", "-s", "-U", "--user", &user])
            .await?
            .lines()
            .filter_map(|l| l.trim().strip_prefix("package:"))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(str::to_string)
            .collect();

        Ok(parse_packages(&all)
            .into_iter()
            .map(|(package, app_id)| InstalledPackage {
                is_system: system.contains(&package),
                label: package.clone(),
                package,
                profile_id,
                app_id,
                // pm does not report permissions; treat every app as network-capable
                has_internet: true,
            })
            .collect())
    }
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Brings the rule store in line with the installed packages.
///
/// - New network-capable packages get an inert rule
/// - Rules whose UID or metadata changed are refreshed (flags kept)
/// - Rules of packages no longer installed in a listed profile are removed
///
/// Profiles the inventory fails to list are left untouched.
pub async fn reconcile(
    store: &dyn RuleStore,
    inventory: &dyn PackageInventory,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let existing: BTreeMap<RuleKey, Rule> = store
        .all()
        .await?
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();

    let mut seen = BTreeSet::new();
    let mut listed_profiles = BTreeSet::new();

    for profile in inventory.profiles().await? {
        let packages = match inventory.packages(profile.id).await {
            Ok(packages) => packages,
            Err(e) => {
                warn!("Skipping profile {} during reconcile: {}", profile.id, e);
                continue;
            }
        };
        listed_profiles.insert(profile.id);

        for pkg in packages.into_iter().filter(|p| p.has_internet) {
            let key = RuleKey::new(pkg.package.clone(), pkg.profile_id);
            seen.insert(key.clone());

            match existing.get(&key) {
                None => {
                    let mut rule = Rule::new(&pkg.package, pkg.profile_id, pkg.app_id, &pkg.label);
                    rule.is_system = pkg.is_system;
                    store.upsert(rule).await?;
                    report.added += 1;
                }
                Some(current)
                    if current.app_id() != pkg.app_id
                        || current.is_system != pkg.is_system
                        || current.label != pkg.label =>
                {
                    let mut rule = current.clone();
                    rule.uid = crate::core::rule::absolute_uid(pkg.profile_id, pkg.app_id);
                    rule.is_system = pkg.is_system;
                    rule.label.clone_from(&pkg.label);
                    rule.updated_at = chrono::Utc::now();
                    store.upsert(rule).await?;
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }
    }

    for key in existing.keys() {
        if listed_profiles.contains(&key.profile_id) && !seen.contains(key) {
            debug!("Package {} no longer installed", key);
            if store.remove(key).await? {
                report.removed += 1;
            }
        }
    }

    info!(
        "Reconciled inventory: {} added, {} updated, {} removed",
        report.added, report.updated, report.removed
    );
    Ok(report)
}
