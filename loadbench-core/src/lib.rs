//! Plain data shared by the loadbench engine and its front ends: run configuration, per-request
//! records and run summaries.
mod config;
mod constants;
mod data;
mod stats;

pub use config::*;
pub use constants::*;
pub use data::*;
pub use stats::*;
