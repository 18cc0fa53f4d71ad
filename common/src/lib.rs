//! RateMesh Common Types
//!
//! This crate contains shared types used across RateMesh crates,
//! including currency codes, request context, and time helpers.

pub mod currency;
pub mod context;
pub mod error;
pub mod time;

pub use currency::*;
pub use context::*;
pub use error::*;
pub use time::*;
