//! Admission algorithms and the decision entry point.

mod algorithm;
mod backend;
mod decision;
mod fixed_window;
mod identity;
mod limiter;
mod sliding_window;
mod token_bucket;

pub use algorithm::{Algorithm, UnknownAlgorithm};
pub use backend::LimitChecker;
pub use decision::{Decision, DecisionEngine};
pub use fixed_window::FixedWindow;
pub use identity::Identity;
pub use limiter::{Admission, Limiter, Remaining};
pub use sliding_window::SlidingWindow;
pub use token_bucket::{TokenBucket, DEFAULT_BUCKET_TTL};
