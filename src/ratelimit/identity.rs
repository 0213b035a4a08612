//! Counting identities and the store keys derived from them.

use crate::store::BucketKeys;

/// The unit of counting: one caller under one rule.
///
/// Scoping by rule keeps a caller's traffic under one rule from consuming
/// its quota under another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// The rule this identity is counted under
    pub rule_id: String,
    /// The caller
    pub client_id: String,
}

impl Identity {
    /// Create a new identity.
    pub fn new(rule_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            client_id: client_id.into(),
        }
    }

    /// Fixed window counter key for the window starting at `window_start` (Unix seconds).
    pub fn fixed_window_key(&self, window_start: i64) -> String {
        format!("fixed:{}:{}", self, window_start)
    }

    /// Sorted set key for the sliding window log.
    pub fn sliding_window_key(&self) -> String {
        format!("sliding:{}", self)
    }

    /// Keys holding the token bucket state.
    pub fn bucket_keys(&self) -> BucketKeys {
        BucketKeys {
            tokens: format!("bucket:{}:tokens", self),
            last_refill: format!("bucket:{}:last_refill", self),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.client_id)
    }
}
