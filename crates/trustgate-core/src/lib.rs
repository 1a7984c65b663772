//! Trustgate Core - Shared functionality for the Trustgate engine and CLI
//!
//! Standard locations for configuration and state, plus small display helpers.

pub mod format;
pub mod paths;

pub use paths::Paths;
