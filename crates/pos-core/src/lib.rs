//! # pos-core
//!
//! Avatar XP ledger, configuration, and error handling for POS.

pub mod config;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod traits;

pub use config::shellexpand;
