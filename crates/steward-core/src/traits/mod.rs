//! Collaborator traits implemented outside the core.

pub mod executor;

pub use executor::PromptExecutor;
