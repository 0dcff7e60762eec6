// src/lib.rs

//! Cellar Formula Engine
//!
//! Source-based package build engine: formulas declare versioned sources,
//! dependencies, and shell build steps; the engine resolves them into a
//! dependency-ordered plan, fetches sources through an integrity-verified
//! cache, builds each formula in an isolated scratch directory, and records
//! an install receipt per success.
//!
//! # Architecture
//!
//! - Formulas: declarative JSON descriptions (source, deps, build steps)
//! - Resolver: depth-first topological ordering with cycle detection
//! - Source cache: content-addressed by sha256, never stores bad downloads
//! - Executor: per-build scratch dir, sequential steps, soft smoke test
//! - Receipts: SQLite store of installed versions and file lists

pub mod build;
mod error;
pub mod fetch;
pub mod formula;
pub mod orchestrator;
pub mod resolver;
pub mod store;

pub use error::{Error, Result};
