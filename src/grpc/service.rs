//! RateLimiter service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument, warn};

use super::proto::rlaas::v1::{
    rate_limiter_server::RateLimiter, CheckLimitRequest, CheckLimitResponse,
};

use crate::error::RlaasError;
use crate::ratelimit::{Decision, LimitChecker};

/// Implementation of the RateLimiter gRPC interface.
pub struct RateLimiterService<C: LimitChecker> {
    /// The limit checker instance
    checker: Arc<C>,
}

impl<C: LimitChecker> RateLimiterService<C> {
    /// Create a new RateLimiterService with the given limit checker.
    pub fn new(checker: Arc<C>) -> Self {
        Self { checker }
    }
}

impl From<Decision> for CheckLimitResponse {
    fn from(decision: Decision) -> Self {
        CheckLimitResponse {
            allowed: decision.admitted,
            remaining: decision.remaining.as_f64(),
            algorithm: decision.algorithm.to_string(),
            retry_after_ms: decision.retry_after_ms(),
        }
    }
}

/// Errors keep their kind on the wire so clients can tell "blocked" (an OK
/// response) from "no decision" (UNAVAILABLE) and from bad setup.
impl From<RlaasError> for Status {
    fn from(err: RlaasError) -> Self {
        match &err {
            RlaasError::InvalidInput(_) => Status::invalid_argument(err.to_string()),
            RlaasError::RuleNotFound(_) | RlaasError::Config(_) => {
                Status::failed_precondition(err.to_string())
            }
            RlaasError::Store(_) | RlaasError::RuleTable(_) => {
                Status::unavailable(err.to_string())
            }
            RlaasError::Grpc(_) | RlaasError::Io(_) => Status::internal(err.to_string()),
        }
    }
}

#[tonic::async_trait]
impl<C: LimitChecker + 'static> RateLimiter for RateLimiterService<C> {
    /// Decide whether one request is admitted.
    #[instrument(
        skip(self, request),
        fields(
            client_id = %request.get_ref().client_id,
            rule_id = %request.get_ref().rule_id
        )
    )]
    async fn check_limit(
        &self,
        request: Request<CheckLimitRequest>,
    ) -> Result<Response<CheckLimitResponse>, Status> {
        let req = request.into_inner();

        let decision = self
            .checker
            .check_limit(&req.client_id, &req.rule_id)
            .await
            .map_err(|e| {
                if e.is_indeterminate() {
                    error!(error = %e, "Limit check failed");
                } else {
                    warn!(error = %e, "Limit check rejected");
                }
                Status::from(e)
            })?;

        debug!(
            allowed = decision.admitted,
            remaining = %decision.remaining,
            algorithm = %decision.algorithm,
            "Limit check decided"
        );

        Ok(Response::new(decision.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::ratelimit::{Algorithm, DecisionEngine, Remaining};
    use crate::rules::{MemoryRuleTable, RuleResolver};
    use crate::store::MemoryCounterStore;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers every check the same way.
    struct FixedChecker(Answer);

    #[async_trait]
    impl LimitChecker for FixedChecker {
        async fn check_limit(&self, _: &str, _: &str) -> crate::error::Result<Decision> {
            (self.0)()
        }
    }

    type Answer = fn() -> crate::error::Result<Decision>;

    fn service(answer: Answer) -> RateLimiterService<FixedChecker> {
        RateLimiterService::new(Arc::new(FixedChecker(answer)))
    }

    fn request(client_id: &str, rule_id: &str) -> Request<CheckLimitRequest> {
        Request::new(CheckLimitRequest {
            client_id: client_id.to_string(),
            rule_id: rule_id.to_string(),
        })
    }

    fn blocked() -> crate::error::Result<Decision> {
        Ok(Decision {
            admitted: false,
            remaining: Remaining::Count(0),
            algorithm: Algorithm::FixedWindow,
            retry_after: Duration::from_secs(60),
            rule_id: "login".into(),
        })
    }

    #[tokio::test]
    async fn test_blank_client_rejected_by_engine() {
        let clock = Arc::new(SystemClock);
        let resolver = RuleResolver::new(
            Arc::new(MemoryRuleTable::new()),
            clock.clone(),
            Duration::from_secs(30),
        );
        resolver.seed_default_rules().await.unwrap();
        let engine = DecisionEngine::new(
            Arc::new(resolver),
            Arc::new(MemoryCounterStore::new()),
            clock,
        );
        let service = RateLimiterService::new(Arc::new(engine));

        for client_id in ["", "  "] {
            let status = service
                .check_limit(request(client_id, "login"))
                .await
                .unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument, "{client_id:?}");
        }

        let response = service
            .check_limit(request("alice", "login"))
            .await
            .unwrap()
            .into_inner();
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_blocked_decision_is_ok_response() {
        let service = service(blocked);

        let response = service
            .check_limit(request("alice", "login"))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.allowed);
        assert_eq!(response.remaining, 0.0);
        assert_eq!(response.algorithm, "fixed_window");
        assert_eq!(response.retry_after_ms, 60_000);
    }

    #[tokio::test]
    async fn test_fractional_tokens_reported() {
        let service = service(|| {
            Ok(Decision {
                admitted: true,
                remaining: Remaining::Tokens(2.5),
                algorithm: Algorithm::TokenBucket,
                retry_after: Duration::ZERO,
                rule_id: "export".into(),
            })
        });

        let response = service
            .check_limit(request("alice", "export"))
            .await
            .unwrap()
            .into_inner();
        assert!(response.allowed);
        assert_eq!(response.remaining, 2.5);
        assert_eq!(response.algorithm, "token_bucket");
        assert_eq!(response.retry_after_ms, 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let service = service(|| Err(StoreError::Timeout(Duration::from_millis(500)).into()));

        let status = service
            .check_limit(request("alice", "login"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_missing_rule_is_failed_precondition() {
        let service = service(|| Err(RlaasError::RuleNotFound("login".into())));

        let status = service
            .check_limit(request("alice", "login"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
