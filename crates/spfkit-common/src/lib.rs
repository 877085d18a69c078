//! spfkit Common - Shared configuration and error types
//!
//! This crate provides the configuration model and the workspace error
//! type shared by the SPF engine and its command-line front end.

pub mod config;
pub mod error;

pub use config::{Config, DnsConfig, ExecutorConfig, ExecutorKind, LoggingConfig, PolicyConfig};
pub use error::{Error, Result};
