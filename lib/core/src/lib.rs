//! Core types shared by the stepweave crates.
//!
//! This crate provides the strongly-typed identifiers and the `Result`
//! alias used throughout the workflow engine.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, RunId, StepId};
