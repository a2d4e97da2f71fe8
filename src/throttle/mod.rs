//! The three admission gates the scheduler composes: a token bucket on
//! request rate, a sliding window on consumed server-side processing time,
//! and an adaptive concurrency limiter.

pub mod concurrency;
pub mod sliding_window;
pub mod token_bucket;

pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit, MAX_CONCURRENT_REQUESTS};
pub use sliding_window::{SlidingWindow, MAX_REQUEST_RUNNING_TIME, MEASUREMENT_PERIOD};
pub use token_bucket::TokenBucket;
