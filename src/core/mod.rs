//! Core numerics and data structures

pub mod base;
pub mod data;
pub mod errors;
