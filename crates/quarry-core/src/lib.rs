//! # quarry-core
//! Foundation types, consensus parameters and collaborator traits for Quarry.

pub mod constants;
pub mod difficulty;
pub mod error;
pub mod merkle;
pub mod params;
pub mod reward;
pub mod traits;
pub mod types;
pub mod validation;
pub mod varint;
