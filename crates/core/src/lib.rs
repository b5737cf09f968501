//! Shared types, error taxonomy, configuration, and external-collaborator
//! contracts for the Clubroom analytics engine.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::ReportingConfig;
pub use error::{ReportError, ReportResult};
