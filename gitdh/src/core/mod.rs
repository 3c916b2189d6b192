//! Deterministic, pure logic shared by the deployment engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod config;
pub mod exec_env;
pub mod ini;
pub mod install;
pub mod revision;
pub mod types;
