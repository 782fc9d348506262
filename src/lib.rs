//! HUNT ENGINE — budget-constrained exhaustive parameter-grid scheduler
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod grid;
pub mod budget;
pub mod queue;
pub mod engine;
pub mod output;
