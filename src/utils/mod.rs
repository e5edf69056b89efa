//! Assertion macros and the R interface helpers.

pub mod macros;

#[cfg(feature = "r")]
pub mod r_rust_interface;
