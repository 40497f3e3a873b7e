//! Slidelog - Distributed Sliding-Window-Log Rate Limiting
//!
//! This crate decides, per caller-supplied identifier, whether the next
//! request may proceed given how many requests that identifier made within a
//! trailing window. Every request is recorded as a timestamped event in a
//! shared store (Redis sorted sets, or memory for a single node), so any
//! number of processes can enforce one limit together.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
