pub mod api;
#[cfg(not(tarpaulin_include))]
pub mod cli;
#[cfg(not(tarpaulin_include))]
pub mod error;
pub mod feed;
pub mod filters;
pub mod fingerprint;
pub mod hierarchy;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod normalize;
pub mod persistence;
pub mod tracker;
pub mod types;
