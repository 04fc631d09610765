//! Agent-driven refinement of fuzz targets and their build scripts.
//!
//! A refinement session lets an agent investigate a target project through a
//! sandboxed shell for a bounded number of steps, then extracts the fuzz target
//! and build script it concludes with. Sessions chain into rounds, each round
//! fed by the dry-run feedback of the one before it.
//!
//! - **[`core`]**: Pure logic (conclusion parsing, tool requests, command
//!   policy, budgets). No I/O.
//! - **[`io`]**: Process execution, prompts, config, work items and artifacts.
//!
//! [`session`] and [`rounds`] drive the state machine over the collaborators
//! in [`io`]; [`refine`] and [`batch`] wire them up for the CLI.

pub mod batch;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod refine;
pub mod rounds;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
