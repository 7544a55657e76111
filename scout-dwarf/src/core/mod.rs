//! Core types and utilities for scout-dwarf

pub mod errors;
pub mod types;

pub use errors::*;
pub use types::*;
