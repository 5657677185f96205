//! PoE port reset engine
//!
//! This module exposes the core functionality for use in integration tests
//! and the main binary.

// Public modules for integration testing
pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod port;
pub mod probe;
pub mod service;
pub mod ssh;
pub mod validation;
pub mod workflow;

// Public modules for the binary
pub mod cli;
pub mod logging;

// Internal modules
pub(crate) mod security_log;
