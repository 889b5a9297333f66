//! Tab Oracle Library
//!
//! Median price oracle for tab-backed assets: aggregates provider feeds into
//! published BTC/tab medians, tracks tab health on chain and signs price
//! attestations for updaters.

pub mod aggregation;
pub mod api;
pub mod archive;
pub mod attestation;
pub mod auth;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod feed;
pub mod fixed_point;
pub mod performance;
pub mod query;
pub mod store;
pub mod types;

pub use error::{OracleError, OracleResult};
