//! Retry backoff and circuit breaking for remote and local I/O.

pub mod retry;
pub mod circuit_breaker;
