//! The admission algorithms a rule can select.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Admission algorithm named by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per aligned window. Bursts straddling a window boundary can
    /// admit up to twice the limit in a short span; use the sliding window
    /// where that matters.
    #[default]
    FixedWindow,
    /// Log of request timestamps over a rolling window.
    SlidingWindow,
    /// Continuously refilled bucket of credits.
    TokenBucket,
}

impl Algorithm {
    /// Name as stored in the rule table and reported to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }

    /// Parse a stored name, treating anything unrecognized (or empty) as
    /// fixed window.
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown algorithm name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAlgorithm(pub String);

impl fmt::Display for UnknownAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown algorithm {:?} (expected fixed_window, sliding_window or token_bucket)",
            self.0
        )
    }
}

impl std::error::Error for UnknownAlgorithm {}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "token_bucket" => Ok(Algorithm::TokenBucket),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}
