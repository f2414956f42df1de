//! The _eidsign_ library crate.

pub mod card;
pub mod cli;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod pdf;
pub mod pin;
pub mod signing;
