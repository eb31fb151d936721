//! Per-application rule records
//!
//! A [`Rule`] is keyed by package name *and* profile, since the same package
//! recurs under personal, work and cloned profiles with distinct UIDs.
//!
//! # Invariant
//!
//! `roaming == true` implies `mobile == true`. All mutations go through
//! [`Rule::apply_change`], which writes both flags together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// UIDs per profile; absolute UID is `profile_id * PER_USER_RANGE + app_id`.
pub const PER_USER_RANGE: u32 = 100_000;

/// First application UID inside a profile.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Last application UID inside a profile.
pub const LAST_APPLICATION_UID: u32 = 19_999;

/// Computes the absolute UID of an app inside a profile.
pub const fn absolute_uid(profile_id: u32, app_id: u32) -> u32 {
    profile_id * PER_USER_RANGE + app_id
}

/// Splits an absolute UID into `(profile_id, app_id)`.
pub const fn split_uid(uid: u32) -> (u32, u32) {
    (uid / PER_USER_RANGE, uid % PER_USER_RANGE)
}

/// Network the device is currently using
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum NetworkClass {
    Wifi,
    Mobile,
    Roaming,
    #[default]
    None,
}

/// Fallback applied to packages with no rule or a disabled rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum DefaultPolicy {
    /// Block everything not explicitly allowed
    BlockAll,
    /// Allow everything not explicitly blocked
    #[default]
    AllowAll,
}

impl DefaultPolicy {
    pub const fn blocks(self) -> bool {
        matches!(self, DefaultPolicy::BlockAll)
    }
}

/// Composite identity of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub package: String,
    pub profile_id: u32,
}

impl RuleKey {
    pub fn new(package: impl Into<String>, profile_id: u32) -> Self {
        Self {
            package: package.into(),
            profile_id,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.profile_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub package: String,
    pub profile_id: u32,
    /// Absolute UID (`profile_id * 100000 + app_id`)
    pub uid: u32,
    pub label: String,
    #[serde(default)]
    pub wifi: bool,
    #[serde(default)]
    pub mobile: bool,
    #[serde(default)]
    pub roaming: bool,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub lan: bool,
    /// Disabled rules are inert; the default policy applies instead
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "default_true")]
    pub has_internet: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Creates an inert rule for a newly observed package.
    pub fn new(
        package: impl Into<String>,
        profile_id: u32,
        app_id: u32,
        label: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            package: package.into(),
            profile_id,
            uid: absolute_uid(profile_id, app_id),
            label: label.into(),
            wifi: false,
            mobile: false,
            roaming: false,
            background: false,
            lan: false,
            enabled: false,
            is_system: false,
            has_internet: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.package.clone(), self.profile_id)
    }

    pub fn app_id(&self) -> u32 {
        split_uid(self.uid).1
    }

    /// Checks the invariants every persisted rule must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.roaming && !self.mobile {
            return Err("roaming cannot be blocked while mobile data is allowed".to_string());
        }
        if split_uid(self.uid).0 != self.profile_id {
            return Err(format!(
                "uid {} does not belong to profile {}",
                self.uid, self.profile_id
            ));
        }
        Ok(())
    }

    /// Applies a field-level change, keeping mobile and roaming consistent.
    ///
    /// Changing any block flag also enables the rule.
    pub fn apply_change(&mut self, change: RuleChange) {
        match change {
            RuleChange::Wifi(block) => self.wifi = block,
            RuleChange::Mobile(block) => {
                self.mobile = block;
                if !block {
                    self.roaming = false;
                }
            }
            RuleChange::Roaming(block) => {
                self.roaming = block;
                if block {
                    self.mobile = true;
                }
            }
            RuleChange::MobileAndRoaming { mobile, roaming } => {
                self.mobile = mobile || roaming;
                self.roaming = roaming;
            }
            RuleChange::Background(block) => self.background = block,
            RuleChange::Lan(block) => self.lan = block,
            RuleChange::Enabled(enabled) => self.enabled = enabled,
            RuleChange::BlockAll => {
                self.wifi = true;
                self.mobile = true;
                self.roaming = true;
            }
            RuleChange::AllowAll => {
                self.wifi = false;
                self.mobile = false;
                self.roaming = false;
                self.background = false;
                self.lan = false;
            }
        }
        if !matches!(change, RuleChange::Enabled(_)) {
            self.enabled = true;
        }
        self.updated_at = Utc::now();
    }
}

/// Atomic field-level mutation of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChange {
    Wifi(bool),
    /// Allowing mobile also allows roaming
    Mobile(bool),
    /// Blocking roaming also blocks mobile
    Roaming(bool),
    MobileAndRoaming { mobile: bool, roaming: bool },
    Background(bool),
    Lan(bool),
    Enabled(bool),
    BlockAll,
    AllowAll,
}
