//! Mock Fixtures
//!
//! Test support for the promotion pipeline: a synthesizer for small but
//! structurally valid managed binaries, and a resource patcher that records
//! invocations instead of shelling out.
//!
//! # Components
//!
//! - [`AssemblyBuilder`]: emit a PE32 image with a CLR metadata root,
//!   an optional informational version attribute, assembly references,
//!   and an optional native resource directory
//! - [`RecordingPatcher`]: in-process [`ResourcePatcher`] with failure
//!   injection for error-path tests
//!
//! [`ResourcePatcher`]: crate::rewrite::ResourcePatcher

mod assembly;
mod patcher;

pub use assembly::AssemblyBuilder;
pub use patcher::{PatchCall, RecordingPatcher};
