//! Rule store
//!
//! The orchestrator reads the full rule set on every reconfigure and listens
//! to [`RuleStore::subscribe`] for changes. Writes are field-level and atomic
//! so concurrent readers never observe a half-updated rule (mobile without
//! roaming and the like).
//!
//! [`RuleTable`] is the bundled implementation: an in-memory map, optionally
//! persisted to a JSON file with the temp-file + rename pattern.

use crate::core::error::{Error, Result};
use crate::core::rule::{Rule, RuleChange, RuleKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Durable table of rules keyed by (package, profile)
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Returns every rule, ordered by key.
    async fn all(&self) -> Result<Vec<Rule>>;

    async fn get(&self, key: &RuleKey) -> Result<Option<Rule>>;

    /// Inserts or replaces a rule. Rejects rules violating invariants.
    async fn upsert(&self, rule: Rule) -> Result<()>;

    /// Applies one field-level change atomically and returns the new rule.
    async fn update(&self, key: &RuleKey, change: RuleChange) -> Result<Rule> {
        self.update_with(key, &[change]).await
    }

    /// Applies several changes to one rule as a single write.
    ///
    /// Readers see either the old rule or the rule with every change applied.
    async fn update_with(&self, key: &RuleKey, changes: &[RuleChange]) -> Result<Rule>;

    /// Applies the same change to several rules as one write. Unknown keys are skipped.
    async fn update_many(&self, keys: &[RuleKey], change: RuleChange) -> Result<usize>;

    async fn remove(&self, key: &RuleKey) -> Result<bool>;

    /// Deletes every rule.
    async fn reset(&self) -> Result<()>;

    /// Revision counter bumped after every successful write.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

pub struct RuleTable {
    rules: RwLock<BTreeMap<RuleKey, Rule>>,
    path: Option<PathBuf>,
    revision: watch::Sender<u64>,
}

impl RuleTable {
    /// Creates a table that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            path: None,
            revision: watch::Sender::new(0),
        }
    }

    /// Opens (or creates) a table persisted at `path`.
    ///
    /// Rules that fail invariant checks on load are dropped with a warning.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rules = BTreeMap::new();

        if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let loaded: Vec<Rule> = serde_json::from_str(&json)?;
            for rule in loaded {
                if let Err(e) = rule.check_invariants() {
                    warn!("Dropping invalid rule {} on load: {}", rule.key(), e);
                    continue;
                }
                rules.insert(rule.key(), rule);
            }
            info!("Loaded {} rules from {:?}", rules.len(), path);
        }

        Ok(Self {
            rules: RwLock::new(rules),
            path: Some(path),
            revision: watch::Sender::new(0),
        })
    }

    /// Opens the table at the default data-directory location.
    pub async fn open_default() -> Result<Self> {
        let mut path = crate::utils::get_data_dir()
            .ok_or_else(|| Error::Internal("Data directory not available".to_string()))?;
        path.push("rules.json");
        Self::open(path).await
    }

    /// Persists `next`, then makes it the live table and bumps the revision.
    ///
    /// Called with the write lock held. A failed write leaves the live table
    /// and the revision untouched, so memory never runs ahead of disk.
    async fn commit(
        &self,
        live: &mut BTreeMap<RuleKey, Rule>,
        next: BTreeMap<RuleKey, Rule>,
    ) -> Result<()> {
        self.persist(&next).await?;
        *live = next;
        self.bump();
        Ok(())
    }

    async fn persist(&self, rules: &BTreeMap<RuleKey, Rule>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<&Rule> = rules.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        crate::utils::write_atomic(path, json.as_bytes()).await?;
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
        debug!("Rule store revision {}", *self.revision.borrow());
    }

    fn invalid(rule: &Rule, message: String) -> Error {
        Error::InvalidRule {
            key: rule.key().to_string(),
            message,
        }
    }
}

#[async_trait]
impl RuleStore for RuleTable {
    async fn all(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn get(&self, key: &RuleKey) -> Result<Option<Rule>> {
        Ok(self.rules.read().await.get(key).cloned())
    }

    async fn upsert(&self, rule: Rule) -> Result<()> {
        rule.check_invariants()
            .map_err(|message| Self::invalid(&rule, message))?;
        crate::validators::validate_package_name(&rule.package)
            .map_err(|message| Self::invalid(&rule, message))?;

        let mut rules = self.rules.write().await;
        let mut next = rules.clone();
        next.insert(rule.key(), rule);
        self.commit(&mut rules, next).await
    }

    async fn update_with(&self, key: &RuleKey, changes: &[RuleChange]) -> Result<Rule> {
        let mut rules = self.rules.write().await;
        let mut updated = rules
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("rule {key}")))?;

        for change in changes {
            updated.apply_change(*change);
        }
        updated
            .check_invariants()
            .map_err(|message| Self::invalid(&updated, message))?;

        let mut next = rules.clone();
        next.insert(key.clone(), updated.clone());
        self.commit(&mut rules, next).await?;
        Ok(updated)
    }

    async fn update_many(&self, keys: &[RuleKey], change: RuleChange) -> Result<usize> {
        let mut rules = self.rules.write().await;
        let mut next = rules.clone();
        let mut count = 0;
        for key in keys {
            if let Some(rule) = next.get_mut(key) {
                rule.apply_change(change);
                rule.check_invariants()
                    .map_err(|message| Self::invalid(rule, message))?;
                count += 1;
            }
        }

        if count == 0 {
            return Ok(0);
        }
        self.commit(&mut rules, next).await?;
        Ok(count)
    }

    async fn remove(&self, key: &RuleKey) -> Result<bool> {
        let mut rules = self.rules.write().await;
        if !rules.contains_key(key) {
            return Ok(false);
        }
        let mut next = rules.clone();
        next.remove(key);
        self.commit(&mut rules, next).await?;
        Ok(true)
    }

    async fn reset(&self) -> Result<()> {
        let mut rules = self.rules.write().await;
        self.commit(&mut rules, BTreeMap::new()).await?;
        info!("Rule store reset");
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
