//! gRPC transport for limit checks.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimiterService;

// Include the generated protobuf code
pub mod proto {
    pub mod rlaas {
        pub mod v1 {
            tonic::include_proto!("rlaas.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::rlaas::v1::{
    rate_limiter_server::RateLimiterServer, CheckLimitRequest, CheckLimitResponse,
};
