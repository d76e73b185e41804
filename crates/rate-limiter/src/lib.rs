//! Sliding-window admission control per credential
//!
//! Each credential gets a trailing 60-second window of request timestamps.
//! A request is admitted when fewer than `limit` timestamps remain after
//! pruning; admission appends the current timestamp in the same step.
//!
//! State is process-local. Several gateway processes each enforce the limit
//! independently, so the effective system-wide ceiling is
//! `limit * instance_count`.

pub mod sweep;
pub mod window;

pub use sweep::spawn_sweeper;
pub use window::{RateDecision, RateLimiter, WINDOW};
