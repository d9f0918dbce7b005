//! Virta Core - shared value model
//!
//! This crate holds the runtime value type used for element payloads and
//! outputs throughout the Virta workspace.

pub mod value;

pub use value::Value;
