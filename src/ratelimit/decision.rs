//! The admission decision: resolve the rule, run its algorithm, report.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::algorithm::Algorithm;
use super::backend::LimitChecker;
use super::fixed_window::FixedWindow;
use super::identity::Identity;
use super::limiter::{Limiter, Remaining};
use super::sliding_window::SlidingWindow;
use super::token_bucket::{TokenBucket, DEFAULT_BUCKET_TTL};
use crate::clock::Clock;
use crate::error::{Result, RlaasError};
use crate::rules::{Rule, RuleResolver};
use crate::store::CounterStore;

/// Outcome of one limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub admitted: bool,
    pub remaining: Remaining,
    pub algorithm: Algorithm,
    /// How long a blocked caller should wait; zero when admitted.
    pub retry_after: Duration,
    /// The rule that was applied, after any fallback to the default rule.
    pub rule_id: String,
}

impl Decision {
    pub fn retry_after_ms(&self) -> i64 {
        i64::try_from(self.retry_after.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Combines rule resolution with the counter store.
pub struct DecisionEngine {
    resolver: Arc<RuleResolver>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    bucket_ttl: Duration,
}

impl DecisionEngine {
    pub fn new(
        resolver: Arc<RuleResolver>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            store,
            clock,
            bucket_ttl: DEFAULT_BUCKET_TTL,
        }
    }

    /// Expiry for token bucket state of idle identities.
    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = ttl;
        self
    }

    pub fn resolver(&self) -> &Arc<RuleResolver> {
        &self.resolver
    }

    fn limiter_for(&self, rule: &Rule) -> Box<dyn Limiter> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let limit = u64::from(rule.limit);
        match rule.algorithm {
            Algorithm::FixedWindow => {
                Box::new(FixedWindow::new(store, clock, limit, rule.window()))
            }
            Algorithm::SlidingWindow => {
                Box::new(SlidingWindow::new(store, clock, limit, rule.window()))
            }
            Algorithm::TokenBucket => Box::new(
                TokenBucket::for_window(store, clock, limit, rule.window())
                    .with_ttl(self.bucket_ttl),
            ),
        }
    }

    /// Decide whether `client_id` may proceed under `rule_id`.
    ///
    /// Store and rule table failures are returned as errors, never as a
    /// decision; the caller picks whether to fail open or closed.
    pub async fn check_limit(&self, client_id: &str, rule_id: &str) -> Result<Decision> {
        if client_id.trim().is_empty() {
            return Err(RlaasError::InvalidInput("client_id is required".into()));
        }

        let rule = self.resolver.get_rule(rule_id).await?;
        // Count under the resolved rule so every caller falling back to the
        // default rule shares the default rule's counters.
        let identity = Identity::new(rule.rule_id.as_str(), client_id);
        let limiter = self.limiter_for(&rule);

        let admission = limiter.allow(&identity).await.map_err(|e| {
            warn!(
                identity = %identity,
                algorithm = %rule.algorithm,
                error = %e,
                "Counter store failed, no decision made"
            );
            RlaasError::Store(e)
        })?;

        let retry_after = if admission.admitted {
            Duration::ZERO
        } else {
            rule.window()
        };

        if admission.admitted {
            debug!(
                identity = %identity,
                algorithm = %rule.algorithm,
                remaining = %admission.remaining,
                "Request admitted"
            );
        } else {
            info!(
                identity = %identity,
                algorithm = %rule.algorithm,
                limit = rule.limit,
                window_secs = rule.window_secs,
                "Request blocked"
            );
        }

        Ok(Decision {
            admitted: admission.admitted,
            remaining: admission.remaining,
            algorithm: rule.algorithm,
            retry_after,
            rule_id: rule.rule_id,
        })
    }
}

#[async_trait]
impl LimitChecker for DecisionEngine {
    async fn check_limit(&self, client_id: &str, rule_id: &str) -> Result<Decision> {
        DecisionEngine::check_limit(self, client_id, rule_id).await
    }
}
