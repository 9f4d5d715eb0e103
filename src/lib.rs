//! placement-bench: reproducible A/B storage-placement benchmarking
//!
//! This crate provisions a bounded-capacity volume per trial, loads a
//! dataset through a chunked pipeline, supervises the dependent workload
//! processes, samples device telemetry in the background and compares the
//! resulting metrics between a baseline and a treatment configuration.

pub mod common;
pub mod config;
pub mod extract;
pub mod host;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod supervisor;
pub mod telemetry;
pub mod trial;
pub mod volume;
