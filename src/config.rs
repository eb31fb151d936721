use crate::core::rule::DefaultPolicy;
use crate::core::state::FirewallMode;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Persisted firewall settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Fallback for packages with no rule or a disabled rule
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    /// Last-known enabled state, used by boot restore
    #[serde(default)]
    pub enabled: bool,
    /// Backend selection mode
    #[serde(default)]
    pub mode: FirewallMode,
    /// Block app traffic at boot until the kernel backend takes over
    #[serde(default)]
    pub boot_protection: bool,
    /// Reconfigure debounce window in milliseconds (default: 300)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Timeout for a single privilege probe (default: 10s)
    #[serde(default = "default_privilege_timeout")]
    pub privilege_timeout_secs: u64,
    /// Upgrade monitor gives up after this long (default: 5 minutes)
    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout_secs: u64,
    /// How long boot restore waits for privilege sources to settle (default: 10s)
    #[serde(default = "default_boot_settle")]
    pub boot_settle_secs: u64,
    /// Enable the audit event log (opt-in, disabled by default)
    #[serde(default)]
    pub enable_event_log: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::AllowAll,
            enabled: false,
            mode: FirewallMode::Auto,
            boot_protection: false,
            debounce_ms: default_debounce_ms(),
            privilege_timeout_secs: default_privilege_timeout(),
            upgrade_timeout_secs: default_upgrade_timeout(),
            boot_settle_secs: default_boot_settle(),
            enable_event_log: false, // Opt-in only for privacy/disk space
        }
    }
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_privilege_timeout() -> u64 {
    10
}

fn default_upgrade_timeout() -> u64 {
    300
}

fn default_boot_settle() -> u64 {
    10
}

impl Settings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn privilege_timeout(&self) -> Duration {
        Duration::from_secs(self.privilege_timeout_secs.clamp(1, 120))
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs.clamp(10, 3600))
    }

    pub fn boot_settle(&self) -> Duration {
        Duration::from_secs(self.boot_settle_secs.min(120))
    }
}

/// Shared, optionally persisted settings.
///
/// Reads are cheap clones; [`SettingsStore::update`] writes the file with
/// the atomic temp-file + rename pattern before publishing the new value.
pub struct SettingsStore {
    settings: RwLock<Settings>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// Settings that are never written to disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            path: None,
        }
    }

    /// Loads settings from `path`, or defaults if the file is missing or unreadable.
    pub async fn load(path: PathBuf) -> Self {
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str::<Settings>(&json).unwrap_or_else(|e| {
                warn!("Ignoring unreadable settings at {:?}: {}", path, e);
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };
        Self {
            settings: RwLock::new(settings),
            path: Some(path),
        }
    }

    /// Loads settings from the default data-directory location.
    pub async fn load_default() -> Self {
        match get_data_dir() {
            Some(mut path) => {
                path.push("settings.json");
                Self::load(path).await
            }
            None => Self::in_memory(Settings::default()),
        }
    }

    pub async fn get(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Applies `f` to the settings and persists the result.
    pub async fn update<F>(&self, f: F) -> std::io::Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.settings.write().await;
        let mut next = guard.clone();
        f(&mut next);
        if next == *guard {
            return Ok(next);
        }
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&next)?;
            crate::utils::write_atomic(path, json.as_bytes()).await?;
        }
        *guard = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::BackendType;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.debounce_ms, 300);
        assert_eq!(settings.mode, FirewallMode::Auto);
        assert_eq!(settings.default_policy, DefaultPolicy::AllowAll);
    }

    #[test]
    fn test_timeouts_are_clamped() {
        let settings = Settings {
            privilege_timeout_secs: 0,
            upgrade_timeout_secs: 1_000_000,
            ..Settings::default()
        };
        assert_eq!(settings.privilege_timeout(), Duration::from_secs(1));
        assert_eq!(settings.upgrade_timeout(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::load(path.clone()).await;
        store
            .update(|s| {
                s.enabled = true;
                s.mode = FirewallMode::Forced(BackendType::KernelRules);
            })
            .await
            .unwrap();

        let reloaded = SettingsStore::load(path).await.get().await;
        assert!(reloaded.enabled);
        assert_eq!(reloaded.mode, FirewallMode::Forced(BackendType::KernelRules));
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let settings = SettingsStore::load(path).await.get().await;
        assert_eq!(settings, Settings::default());
    }
}
