//! Shared building blocks for the desklink crates: configuration model and
//! the common error type.

pub mod config;
pub mod error;

pub use error::{Error, Result};
