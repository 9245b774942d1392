//! Tollgate - Admission Control and Request Accounting Middleware
//!
//! This crate implements a per-request admission-control and accounting
//! middleware for Axum services. It enforces sliding-window rate limits
//! keyed by client identity, reconciles provisional quota charges once the
//! downstream handler reveals a request's final classification, and
//! aggregates traffic counters off the request's critical path.

pub mod accounting;
pub mod admission;
pub mod config;
pub mod deferred;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod middleware;
