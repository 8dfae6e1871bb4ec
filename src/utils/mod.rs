//! Shared helpers: tracing bootstrap and retry policy.

pub mod bootstrap;
pub mod retry;
