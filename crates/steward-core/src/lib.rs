//! # Steward Core
//!
//! Shared error taxonomy, configuration and collaborator traits for the
//! Steward state & scheduling core.

pub mod config;
pub mod error;
pub mod traits;

pub use config::StewardConfig;
pub use error::{Result, StewardError};
pub use traits::PromptExecutor;
