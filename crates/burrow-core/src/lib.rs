//! `Burrow` Core Library
//!
//! Shared functionality for `Burrow` components:
//! - Machine list configuration and runtime settings
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, MachineConfig, Settings};
pub use error::{Error, Result};
