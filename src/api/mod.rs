//! Upstream game-data API access.
//!
//! Layers, leaf-first:
//! - `rate_limiter`: token bucket shared by every request
//! - `executor`:     one logical request with retry and classification
//! - `transport`:    pooled reqwest client behind the `Transport` trait
//! - `client`:       typed endpoint surface
//! - `models`:       payload shapes

pub mod client;
pub mod executor;
pub mod models;
pub mod rate_limiter;
pub mod transport;
