//! Rule records and the inputs used to create and change them.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, RlaasError};
use crate::ratelimit::Algorithm;

/// Rule applied when the requested rule id has no enabled rule.
pub const DEFAULT_RULE_ID: &str = "default";

/// A named rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name
    pub rule_id: String,
    /// Identity scope; `None` covers every client
    pub client_scope: Option<String>,
    /// Admission algorithm
    pub algorithm: Algorithm,
    /// Requests (or tokens) allowed per window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u32,
    /// Disabled rules are invisible to resolution
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_secs))
    }
}

/// A rule to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub rule_id: String,
    #[serde(default, alias = "client_id")]
    pub client_scope: Option<String>,
    /// Algorithm name; absent means fixed window
    #[serde(default)]
    pub algorithm: Option<String>,
    pub limit: u32,
    pub window_secs: u32,
}

impl NewRule {
    pub fn new(
        rule_id: impl Into<String>,
        algorithm: Algorithm,
        limit: u32,
        window_secs: u32,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            client_scope: None,
            algorithm: Some(algorithm.as_str().to_string()),
            limit,
            window_secs,
        }
    }

    /// Check the fields and build the enabled rule, stamped with `now`.
    pub fn into_rule(self, now: DateTime<Utc>) -> Result<Rule> {
        let rule_id = self.rule_id.trim();
        if rule_id.is_empty() {
            return Err(RlaasError::InvalidInput("rule_id must not be empty".into()));
        }
        if self.limit == 0 {
            return Err(RlaasError::InvalidInput(format!(
                "rule {:?}: limit must be greater than zero",
                rule_id
            )));
        }
        if self.window_secs == 0 {
            return Err(RlaasError::InvalidInput(format!(
                "rule {:?}: window_secs must be greater than zero",
                rule_id
            )));
        }

        let algorithm = match self.algorithm.as_deref().map(str::trim) {
            None | Some("") => Algorithm::default(),
            Some(name) => name
                .parse::<Algorithm>()
                .map_err(|e| RlaasError::InvalidInput(format!("rule {:?}: {}", rule_id, e)))?,
        };

        Ok(Rule {
            rule_id: rule_id.to_string(),
            client_scope: self.client_scope.filter(|s| !s.trim().is_empty()),
            algorithm,
            limit: self.limit,
            window_secs: self.window_secs,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial change to a rule. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUpdate {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub window_secs: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RuleUpdate {
    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(RlaasError::InvalidInput(
                "limit must be greater than zero".into(),
            ));
        }
        if self.window_secs == Some(0) {
            return Err(RlaasError::InvalidInput(
                "window_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply to `rule` in place.
    pub fn apply(&self, rule: &mut Rule, now: DateTime<Utc>) {
        if let Some(limit) = self.limit {
            rule.limit = limit;
        }
        if let Some(window_secs) = self.window_secs {
            rule.window_secs = window_secs;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = now;
    }
}

/// The baseline rules every deployment starts with.
pub fn default_seed_rules() -> Vec<NewRule> {
    vec![
        NewRule::new(DEFAULT_RULE_ID, Algorithm::FixedWindow, 10, 60),
        NewRule::new("login", Algorithm::FixedWindow, 5, 60),
        NewRule::new("search", Algorithm::SlidingWindow, 30, 10),
        NewRule::new("upload", Algorithm::FixedWindow, 3, 60),
    ]
}

/// A YAML file of rules to seed at startup.
///
/// ```yaml
/// rules:
///   - rule_id: export
///     algorithm: token_bucket
///     limit: 20
///     window_secs: 60
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub rules: Vec<NewRule>,
}

impl SeedFile {
    /// Load seed rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading seed rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load seed rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RlaasError::Config(format!("Failed to parse seed rules: {}", e)))
    }
}
