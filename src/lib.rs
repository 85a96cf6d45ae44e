//! Ledger Migrator Library
//!
//! Resumable migration of member balances from a legacy ledger contract to a
//! replacement split across two chains joined by a bridge.

pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod migration;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
