//! Dependency-tracking invalidation for cached computed output.
//!
//! See [`cache`] for the cache itself. [`config`] and [`infra`] hold the settings
//! loader and process bootstrap used by the `depcache` binary.

pub mod cache;
pub mod config;
pub mod infra;
