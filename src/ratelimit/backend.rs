//! Limit checker trait the transport is written against.

use async_trait::async_trait;

use super::decision::Decision;
use crate::error::Result;

/// Anything that can answer a limit check.
///
/// This lets the gRPC service run against the real decision engine or a
/// stand-in.
#[async_trait]
pub trait LimitChecker: Send + Sync {
    /// Decide whether `client_id` may proceed under `rule_id`.
    async fn check_limit(&self, client_id: &str, rule_id: &str) -> Result<Decision>;
}
