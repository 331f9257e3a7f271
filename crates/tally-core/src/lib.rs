//! Core domain + application logic for the Tally expense bot.
//!
//! This crate is framework-agnostic. The chat transport and the database live
//! behind ports (traits) implemented in adapter crates.

pub mod audit;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fingerprint;
pub mod ingest;
pub mod linking;
pub mod logging;
pub mod messaging;
pub mod offset;
pub mod ports;
pub mod recorder;
#[cfg(any(test, feature = "test-util"))]
pub mod store;

pub use errors::{Error, Result};
