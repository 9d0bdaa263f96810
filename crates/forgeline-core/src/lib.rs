//! Core domain types and traits for the pipeline orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and the shared error taxonomy
//! - Graph and legacy pipeline definitions, pipeline runs, step runs
//! - Tagged step-kind types and the per-step executor trait
//! - Worker and workspace state machines
//! - Execution keys and the step-execution state machine
//! - Debug-session types and the breakpoint-observer trait
//! - Per-step bearer tokens

pub mod debug;
pub mod error;
pub mod execution;
pub mod id;
pub mod pipeline;
pub mod repository;
pub mod step;
pub mod token;
pub mod worker;
pub mod workspace;

pub use error::{Error, Result};
pub use id::ResourceId;
