//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod condition;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod ports;

pub use error::{Error, Result};
