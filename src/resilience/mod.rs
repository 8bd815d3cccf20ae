//! Resilience primitives for the remote leg and the store.

pub mod circuit_breaker;
pub mod retry;
