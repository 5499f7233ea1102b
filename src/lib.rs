//! nupkg-promote - NuGet package promotion tool
//!
//! This crate promotes continuous-integration packages to release packages:
//! it rewrites the informational version embedded in product binaries,
//! corrects the package manifest, optionally splits debug symbols into a
//! companion package, and re-emits each archive under its release name.

pub mod archive;
pub mod cil;
pub mod manifest;
pub mod mock;
pub mod pipeline;
pub mod resolver;
pub mod rewrite;

pub use pipeline::{BinaryReport, Pipeline, PipelineConfig, PipelineError, Verifier};
pub use rewrite::{HelperPatcher, ResourcePatcher};
