//! The durable rule table.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::rule::{Rule, RuleUpdate};

/// Errors from the durable rule table.
#[derive(Debug, Clone, Error)]
pub enum RuleTableError {
    /// The table could not be read or written.
    #[error("rule table unavailable: {0}")]
    Backend(String),

    /// A rule with this id already exists.
    #[error("rule {0:?} already exists")]
    Conflict(String),

    /// No rule with this id exists.
    #[error("rule {0:?} does not exist")]
    NotFound(String),

    /// A stored row could not be turned into a rule.
    #[error("corrupt rule row: {0}")]
    Corrupt(String),
}

impl RuleTableError {
    /// True when the table itself failed, as opposed to the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RuleTableError::Backend(_) | RuleTableError::Corrupt(_))
    }
}

/// Storage for rules, independent of the backing database.
#[async_trait]
pub trait RuleTable: Send + Sync {
    /// Every enabled rule.
    async fn load_enabled(&self) -> Result<Vec<Rule>, RuleTableError>;

    /// Every rule, enabled or not, oldest first.
    async fn list_all(&self) -> Result<Vec<Rule>, RuleTableError>;

    /// Insert a new rule; fails with `Conflict` if the id is taken.
    async fn insert(&self, rule: &Rule) -> Result<(), RuleTableError>;

    /// Insert unless the id is taken. Returns whether a row was written.
    async fn insert_if_absent(&self, rule: &Rule) -> Result<bool, RuleTableError>;

    /// Apply a partial update and return the stored result.
    async fn update(
        &self,
        rule_id: &str,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Rule, RuleTableError>;

    /// Soft delete.
    async fn disable(&self, rule_id: &str, now: DateTime<Utc>) -> Result<(), RuleTableError>;
}

/// Process-local rule table.
#[derive(Debug, Default)]
pub struct MemoryRuleTable {
    rows: DashMap<String, (u64, Rule)>,
    sequence: AtomicU64,
}

impl MemoryRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn sorted(&self, filter: impl Fn(&Rule) -> bool) -> Vec<Rule> {
        let mut rows: Vec<(u64, Rule)> = self
            .rows
            .iter()
            .filter(|r| filter(&r.value().1))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| (a.1.created_at, a.0).cmp(&(b.1.created_at, b.0)));
        rows.into_iter().map(|(_, rule)| rule).collect()
    }
}

#[async_trait]
impl RuleTable for MemoryRuleTable {
    async fn load_enabled(&self) -> Result<Vec<Rule>, RuleTableError> {
        Ok(self.sorted(|r| r.enabled))
    }

    async fn list_all(&self) -> Result<Vec<Rule>, RuleTableError> {
        Ok(self.sorted(|_| true))
    }

    async fn insert(&self, rule: &Rule) -> Result<(), RuleTableError> {
        match self.rows.entry(rule.rule_id.clone()) {
            Entry::Occupied(_) => Err(RuleTableError::Conflict(rule.rule_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert((self.next_sequence(), rule.clone()));
                Ok(())
            }
        }
    }

    async fn insert_if_absent(&self, rule: &Rule) -> Result<bool, RuleTableError> {
        match self.rows.entry(rule.rule_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert((self.next_sequence(), rule.clone()));
                Ok(true)
            }
        }
    }

    async fn update(
        &self,
        rule_id: &str,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Rule, RuleTableError> {
        let mut row = self
            .rows
            .get_mut(rule_id)
            .ok_or_else(|| RuleTableError::NotFound(rule_id.to_string()))?;
        update.apply(&mut row.1, now);
        Ok(row.1.clone())
    }

    async fn disable(&self, rule_id: &str, now: DateTime<Utc>) -> Result<(), RuleTableError> {
        let disable = RuleUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        self.update(rule_id, &disable, now).await.map(|_| ())
    }
}
