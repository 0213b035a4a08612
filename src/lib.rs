//! rlaas - Rate Limiting as a Service
//!
//! Decides whether a request from a client may proceed under a named rule.
//! Rules live in a durable table and are served through a short-lived cache;
//! per-client counters live in a shared store and are updated atomically, so
//! any number of service instances can enforce the same limits.

pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod rules;
pub mod store;
