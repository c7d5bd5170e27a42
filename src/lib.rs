//! Cordatus Flash - provision Jetson-class boards
//!
//! Resolves a (vendor, product, module, release, storage) selection into a
//! flash plan, fetches and unpacks the vendor archives into a versioned
//! cache, and drives the vendor flashing tools while reporting progress.

pub mod cache;
pub mod compat;
pub mod config;
pub mod error;
pub mod logging;
pub mod plan;
pub mod progress;
pub mod runner;
pub mod sequencer;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{CacheError, FlashError, ResolutionError, RunnerError};
