//! WAGERBOOK: GP wager, pot-betting and stipend engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod storage;
pub mod providers;
pub mod engine;
pub mod dashboard;
