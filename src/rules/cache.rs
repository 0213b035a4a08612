//! Rule resolution through a time-bounded snapshot of the rule table.
//!
//! The resolver holds a complete copy of every enabled rule. Readers take the
//! snapshot under a shared lock; a reload builds a new map off-lock and swaps
//! it in whole, so readers see either the old rules or the new ones. Reloads
//! are serialized: callers that queue behind a reload reuse its result, and a
//! failed reload answers for everyone queued behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::rule::{default_seed_rules, NewRule, Rule, RuleUpdate, DEFAULT_RULE_ID};
use super::table::{RuleTable, RuleTableError};
use crate::clock::Clock;
use crate::config::RulesConfig;
use crate::error::{Result, RlaasError};

type RuleMap = Arc<HashMap<String, Rule>>;

/// Deadline value that is never fresh.
const STALE: i64 = i64::MIN;

/// Pause after a failed reload before the table is queried again.
const RELOAD_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Snapshot {
    rules: RuleMap,
    loaded: bool,
}

fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Resolves rule ids to rules and carries the admin write path.
pub struct RuleResolver {
    table: Arc<dyn RuleTable>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    serve_stale_on_error: bool,
    snapshot: RwLock<Snapshot>,
    /// Wall-clock freshness deadline in microseconds, or `STALE`.
    fresh_until: AtomicI64,
    reload_lock: Mutex<()>,
    /// Bumped by every invalidation.
    invalidations: AtomicU64,
    /// Bumped by every completed reload.
    reloads: AtomicU64,
    /// Bumped by every failed reload.
    failures: AtomicU64,
    /// No table query before this time, in microseconds.
    retry_at: AtomicI64,
    last_error: parking_lot::Mutex<Option<RuleTableError>>,
}

impl RuleResolver {
    pub fn new(table: Arc<dyn RuleTable>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            table,
            clock,
            ttl,
            serve_stale_on_error: true,
            snapshot: RwLock::new(Snapshot::default()),
            fresh_until: AtomicI64::new(STALE),
            reload_lock: Mutex::new(()),
            invalidations: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retry_at: AtomicI64::new(i64::MIN),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    pub fn from_config(
        table: Arc<dyn RuleTable>,
        clock: Arc<dyn Clock>,
        config: &RulesConfig,
    ) -> Self {
        Self::new(table, clock, Duration::from_secs(config.cache_ttl_secs))
            .with_serve_stale_on_error(config.serve_stale_on_error)
    }

    /// Whether a failed reload falls back to the last loaded rules.
    pub fn with_serve_stale_on_error(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    fn is_fresh(&self, now_micros: i64) -> bool {
        now_micros < self.fresh_until.load(Ordering::SeqCst)
    }

    /// Look up the enabled rule for `rule_id`, falling back to the default rule.
    pub async fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        // Read before the snapshot so a reload finishing in between is seen.
        let seen_reloads = self.reloads.load(Ordering::SeqCst);
        let seen_failures = self.failures.load(Ordering::SeqCst);

        if self.is_fresh(self.clock.now_micros()) {
            if let Some(rule) = self.snapshot.read().rules.get(rule_id) {
                debug!(rule_id, "Rule cache hit");
                return Ok(rule.clone());
            }
        }

        debug!(rule_id, "Rule cache miss");
        let rules = match self.reload(seen_reloads, seen_failures).await {
            Ok(rules) => rules,
            Err(e) => {
                let snapshot = self.snapshot.read();
                if !(snapshot.loaded && self.serve_stale_on_error) {
                    return Err(e.into());
                }
                warn!(
                    error = %e,
                    rule_id,
                    "Rule reload failed, serving last loaded rules"
                );
                snapshot.rules.clone()
            }
        };

        resolve(&rules, rule_id)
    }

    /// Make the next lookup reload from the table. Never waits on readers
    /// or on a reload in progress.
    pub fn invalidate_cache(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.fresh_until.store(STALE, Ordering::SeqCst);
        self.retry_at.store(i64::MIN, Ordering::SeqCst);
        debug!("Rule cache invalidated");
    }

    async fn reload(
        &self,
        seen_reloads: u64,
        seen_failures: u64,
    ) -> std::result::Result<RuleMap, RuleTableError> {
        let _guard = self.reload_lock.lock().await;
        let now = self.clock.now_micros();

        if self.reloads.load(Ordering::SeqCst) != seen_reloads && self.is_fresh(now) {
            return Ok(self.snapshot.read().rules.clone());
        }

        let failed_while_queued = self.failures.load(Ordering::SeqCst) != seen_failures;
        if failed_while_queued || now < self.retry_at.load(Ordering::SeqCst) {
            if let Some(error) = self.last_error.lock().clone() {
                debug!(failed_while_queued, "Skipping reload after recent failure");
                return Err(error);
            }
        }

        let generation = self.invalidations.load(Ordering::SeqCst);
        let loaded = match self.table.load_enabled().await {
            Ok(loaded) => loaded,
            Err(e) => {
                *self.last_error.lock() = Some(e.clone());
                self.retry_at.store(
                    self.clock
                        .now_micros()
                        .saturating_add(micros(RELOAD_RETRY_BACKOFF)),
                    Ordering::SeqCst,
                );
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        let rules: RuleMap = Arc::new(
            loaded
                .into_iter()
                .map(|rule| (rule.rule_id.clone(), rule))
                .collect(),
        );

        {
            let mut snapshot = self.snapshot.write();
            snapshot.rules = rules.clone();
            snapshot.loaded = true;
        }
        *self.last_error.lock() = None;
        self.retry_at.store(i64::MIN, Ordering::SeqCst);

        self.fresh_until.store(
            self.clock.now_micros().saturating_add(micros(self.ttl)),
            Ordering::SeqCst,
        );
        // An invalidation during the load leaves the snapshot stale.
        if self.invalidations.load(Ordering::SeqCst) != generation {
            self.fresh_until.store(STALE, Ordering::SeqCst);
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);

        info!(rules = rules.len(), "Reloaded rules");
        Ok(rules)
    }

    /// Every rule in the table, enabled or not, oldest first.
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.table.list_all().await?)
    }

    /// Insert the built-in baseline rules that are not already present.
    pub async fn seed_default_rules(&self) -> Result<usize> {
        self.seed_rules(default_seed_rules()).await
    }

    /// Insert each rule whose id is not already taken. Existing rows are
    /// left untouched. Returns how many rules were inserted.
    pub async fn seed_rules(&self, rules: Vec<NewRule>) -> Result<usize> {
        let now = self.clock.now_utc();
        let mut inserted = 0;
        for new_rule in rules {
            let rule = new_rule.into_rule(now)?;
            if self.table.insert_if_absent(&rule).await? {
                debug!(rule_id = %rule.rule_id, "Seeded rule");
                inserted += 1;
            }
        }

        if inserted > 0 {
            self.invalidate_cache();
        }
        info!(inserted, "Seeded rules");
        Ok(inserted)
    }

    pub async fn create_rule(&self, new_rule: NewRule) -> Result<Rule> {
        let rule = new_rule.into_rule(self.clock.now_utc())?;
        self.table.insert(&rule).await?;
        self.invalidate_cache();

        info!(
            rule_id = %rule.rule_id,
            algorithm = %rule.algorithm,
            limit = rule.limit,
            window_secs = rule.window_secs,
            "Created rule"
        );
        Ok(rule)
    }

    pub async fn update_rule(&self, rule_id: &str, update: RuleUpdate) -> Result<Rule> {
        update.validate()?;
        let rule = self
            .table
            .update(rule_id, &update, self.clock.now_utc())
            .await?;
        self.invalidate_cache();

        info!(
            rule_id,
            limit = rule.limit,
            window_secs = rule.window_secs,
            enabled = rule.enabled,
            "Updated rule"
        );
        Ok(rule)
    }

    /// Soft delete: the row stays but is no longer resolved.
    pub async fn disable_rule(&self, rule_id: &str) -> Result<()> {
        self.table.disable(rule_id, self.clock.now_utc()).await?;
        self.invalidate_cache();

        info!(rule_id, "Disabled rule");
        Ok(())
    }
}

fn resolve(rules: &HashMap<String, Rule>, rule_id: &str) -> Result<Rule> {
    if let Some(rule) = rules.get(rule_id) {
        return Ok(rule.clone());
    }
    if let Some(rule) = rules.get(DEFAULT_RULE_ID) {
        debug!(rule_id, "No enabled rule, using default");
        return Ok(rule.clone());
    }
    Err(RlaasError::RuleNotFound(rule_id.to_string()))
}
