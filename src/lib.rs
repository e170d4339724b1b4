// src/lib.rs

//! tsuku
//!
//! Installs developer tools from declarative recipes without root.
//!
//! # Architecture
//!
//! - Recipes: ordered steps naming registered actions
//! - Plans: a recipe evaluated for one target, composites expanded into
//!   primitives and every download pinned to a checksum
//! - Execution: primitives run in order into `$TSUKU_HOME/tools/<name>-<version>`
//! - Trust: https only, checksums verified while streaming, optional
//!   fingerprint-pinned PGP signatures

pub mod actions;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod download;
mod error;
pub mod executor;
pub mod hash;
pub mod params;
pub mod planner;
pub mod platform;
pub mod process;
pub mod recipe;
pub mod security;
pub mod signature;

pub use actions::{
    Action, ActionDeps, Decomposable, DependencyMap, Downloader, EvalContext, ExecutionContext,
    PreflightResult, Registry, Step, default_registry,
};
pub use cancel::CancelToken;
pub use config::TsukuHome;
pub use error::{Error, Result};
pub use executor::{Executor, InstallOutcome};
pub use hash::HashAlgorithm;
pub use planner::{InstallationPlan, PlanConfig, Planner, ResolvedStep};
pub use platform::{Constraint, Target, WhenClause};
pub use recipe::Recipe;
