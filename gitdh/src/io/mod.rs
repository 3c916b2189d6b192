//! I/O adapters for git-dh commands.

pub mod config_resolver;
pub mod executor;
pub mod git;
pub mod install;
pub mod process;
pub mod state_store;
