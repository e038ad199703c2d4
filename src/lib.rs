//! Airlimit - pluggable rate limiting
//!
//! This crate implements token bucket, leaky bucket, sliding window and
//! sliding log limiters. Every algorithm has an in-process backend; the
//! leaky bucket, sliding log and sliding window also run against a shared
//! Redis-compatible store through atomic Lua scripts.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
