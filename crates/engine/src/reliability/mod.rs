//! Reliability patterns
//!
//! - [`RetryPolicy`] exponential backoff with jitter

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::RetryPolicy;
