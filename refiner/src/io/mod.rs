//! Side-effecting collaborators for refinement sessions.

pub mod agent;
pub mod artifacts;
pub mod broker;
pub mod config;
pub mod dry_run;
pub mod process;
pub mod prompt;
pub mod work_item;
