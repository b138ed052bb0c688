//! Ratecache - shared-quota rate limit cache engine
//!
//! This crate decides whether a request described by rate limit descriptors
//! is within its configured quotas. Counters live in a shared store (Redis)
//! so every instance of the service enforces the same quota; operations are
//! pipelined, counter expirations are jittered, and a local near-cache
//! absorbs traffic for keys already known to be over limit.

pub mod config;
pub mod error;
pub mod filter;
pub mod ratelimit;
pub mod service;
pub mod store;
