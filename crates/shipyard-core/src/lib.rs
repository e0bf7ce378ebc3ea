//! `shipyard-core` — configuration, errors and value types shared by every
//! shipyard crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Result, ShipyardError};
