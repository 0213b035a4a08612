//! The contract shared by the admission algorithms.

use async_trait::async_trait;

use super::algorithm::Algorithm;
use super::identity::Identity;
use crate::store::StoreError;

/// Capacity left for an identity after a decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Remaining {
    /// Requests left in the current window.
    Count(u64),
    /// Fractional tokens left in the bucket.
    Tokens(f64),
}

impl Remaining {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Remaining::Count(n) => n as f64,
            Remaining::Tokens(t) => t,
        }
    }
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remaining::Count(n) => write!(f, "{}", n),
            Remaining::Tokens(t) => write!(f, "{:.3}", t),
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub admitted: bool,
    pub remaining: Remaining,
}

/// An admission algorithm bound to one rule's parameters.
///
/// `allow` mutates the identity's counter state in the store as a single
/// atomic operation. A store failure means no decision was made.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The algorithm this limiter runs.
    fn algorithm(&self) -> Algorithm;

    /// Count one request against `identity` and decide whether it is admitted.
    async fn allow(&self, identity: &Identity) -> Result<Admission, StoreError>;
}
