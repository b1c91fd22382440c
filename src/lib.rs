#![deny(clippy::mod_module_files)]
//! Emits converted Subversion history into git repositories through
//! `git fast-import`, one importer per destination repository.

pub mod changes;
pub mod config;
pub mod error;
pub mod git;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
