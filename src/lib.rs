//! Throttlekit - Bandwidth Throttling for Streaming Producers
//!
//! This crate bounds the throughput of byte streams to a configured rate
//! while keeping bursts small, and measures the rate actually achieved.
//! Throttlers block the calling thread; they can be shared between streams
//! and threads through an `Arc`.

pub mod config;
pub mod error;
pub mod stream;
pub mod throttle;
