//! Helios server
//!
//! Configuration, logging and the master/agent runtime behind the `helios`
//! binary.

pub mod config;
pub mod metrics;
pub mod runtime;
pub mod startup;
