//! Ratewarden - Adaptive Rate Limiting Engine
//!
//! This crate decides, for every inbound operation, whether it may proceed.
//! It counts requests in per-key sliding windows, puts repeat offenders in
//! an exponentially growing penalty box, smooths short bursts with token
//! buckets and composes per-user, per-endpoint and global limits into one
//! verdict. The same decision logic can run in-process or over a shared
//! store for multi-instance deployments.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
