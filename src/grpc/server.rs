//! gRPC server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tracing::{error, info};

use super::proto::rlaas::v1::rate_limiter_server::RateLimiterServer;
use super::service::RateLimiterService;
use crate::config::ServerConfig;
use crate::error::{Result, RlaasError};
use crate::ratelimit::LimitChecker;

/// gRPC server for the RateLimiter service.
pub struct GrpcServer<C: LimitChecker + 'static> {
    addr: SocketAddr,
    /// Deadline applied to every call; an expired call is answered with
    /// CANCELLED while any store round trip already sent runs to completion.
    request_timeout: Duration,
    checker: Arc<C>,
}

impl<C: LimitChecker + 'static> GrpcServer<C> {
    pub fn new(config: &ServerConfig, checker: Arc<C>) -> Self {
        Self {
            addr: config.grpc_addr,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            checker,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `signal` resolves, then drain in-flight calls.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            timeout_ms = self.request_timeout.as_millis() as u64,
            "Starting gRPC server for RateLimiter"
        );

        Server::builder()
            .timeout(self.request_timeout)
            .add_service(RateLimiterServer::new(RateLimiterService::new(self.checker)))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, addr = %self.addr, "gRPC server failed");
                RlaasError::Grpc(e)
            })
    }
}
