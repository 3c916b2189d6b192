//! Branch-triggered deployments for git repositories.
//!
//! A deployment is triggered either by a post-receive hook (one pushed ref
//! per invocation) or by a cron sweep over every configured branch. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (configuration model, INI
//!   parsing, event derivation, child environments). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, child processes, state store,
//!   configuration resolution, installer files). Isolated behind traits so
//!   tests can substitute fakes.
//!
//! Orchestration modules ([`source`], [`deploy`], [`orchestrate`],
//! [`install`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod deploy;
pub mod error;
pub mod exit_codes;
pub mod install;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod pool;
pub mod source;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
