//! Rule enforcement for Git histories.
//!
//! `bark` guarantees that every commit reachable on a protected reference
//! satisfies a set of declarative *commit rules*, and that each protected
//! reference additionally satisfies *ref rules*. Rules are stored inside
//! the repository, on the reserved `refs/heads/bark_rules` branch, so the
//! rule set is versioned and verified by the same machinery as ordinary
//! code.
#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod cache;
pub mod engine;
pub mod git;
#[cfg(feature = "logger")]
pub mod logger;
pub mod policy;
pub mod project;
pub mod rule;
pub mod rules;
#[cfg(any(test, feature = "test"))]
pub mod test;
pub mod verify;

pub use cache::Cache;
pub use git::{Commit, Oid, RefUpdate, Repository};
pub use project::Project;
pub use rule::{Registry, RuleData, Violation};
pub use verify::Report;
