//! Version Rewriting
//!
//! Rewrites the informational version recorded in a managed binary,
//! resolving its product references on disk through an
//! [`AssemblyResolver`] so a dangling reference fails loudly. Binaries
//! that carry a native resource directory additionally get their win32
//! version resource patched through a [`ResourcePatcher`] after the
//! metadata write lands on disk.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use thiserror::Error;

use crate::cil::{AssemblyFile, CilError};
use crate::resolver::{AssemblyResolver, ResolveError};

/// Helper executable patching win32 version resources, looked up on PATH.
pub const PATCH_HELPER: &str = "edit-win32.sh";

/// Error from a win32 resource patch attempt
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to launch resource patch helper {helper}: {source}")]
    Spawn {
        helper: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resource patch helper {helper} exited with {status} for {path}")]
    Failed {
        helper: String,
        status: ExitStatus,
        path: PathBuf,
    },
}

/// Error from a version rewrite pass
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to rewrite metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: CilError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Patches the native win32 version resource of a binary.
///
/// Managed metadata is rewritten in-process; the native resource table is
/// delegated to an implementation of this trait so tests can observe the
/// calls without an external tool installed.
pub trait ResourcePatcher: Send + Sync {
    fn patch(&self, path: &Path, old_version: &str, new_version: &str) -> Result<(), PatchError>;
}

/// Production patcher shelling out to [`PATCH_HELPER`].
pub struct HelperPatcher {
    helper: PathBuf,
}

impl HelperPatcher {
    pub fn new() -> Self {
        Self { helper: PathBuf::from(PATCH_HELPER) }
    }

    /// Use a specific helper executable instead of the PATH lookup.
    pub fn with_helper(helper: impl Into<PathBuf>) -> Self {
        Self { helper: helper.into() }
    }
}

impl Default for HelperPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcePatcher for HelperPatcher {
    fn patch(&self, path: &Path, old_version: &str, new_version: &str) -> Result<(), PatchError> {
        let status = Command::new(&self.helper)
            .arg(path)
            .arg(old_version)
            .arg(new_version)
            .status()
            .map_err(|source| PatchError::Spawn {
                helper: self.helper.display().to_string(),
                source,
            })?;

        if !status.success() {
            return Err(PatchError::Failed {
                helper: self.helper.display().to_string(),
                status,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// A binary rewritten to a new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub path: PathBuf,
    pub old_version: String,
}

/// Rewrite the informational version of the binary at `path`, returning
/// the version it carried before.
///
/// Every referenced assembly whose name starts with `reference_prefix` or
/// sits in the resolver's override table must resolve on disk; a dangling
/// reference aborts the rewrite before anything is written. Referenced
/// binaries themselves are left untouched — each one is rewritten when
/// the orchestrator reaches its own package. The metadata write is
/// persisted first, then windows-targeted binaries get their native
/// version resource patched in place on the saved file.
pub fn rewrite_version(
    path: &Path,
    new_version: &str,
    reference_prefix: &str,
    resolver: &mut AssemblyResolver,
    patcher: &dyn ResourcePatcher,
) -> Result<Rewritten, RewriteError> {
    let metadata_err = |source| RewriteError::Metadata { path: path.to_path_buf(), source };

    let mut assembly = AssemblyFile::open(path).map_err(metadata_err)?;
    let old_version = assembly
        .set_informational_version(new_version)
        .map_err(metadata_err)?;
    let windows_targeted = assembly.has_native_version_resource().map_err(metadata_err)?;

    for name in assembly.assembly_refs().map_err(metadata_err)? {
        if name.starts_with(reference_prefix) || resolver.has_override(&name) {
            resolver.resolve(&name)?;
        }
    }

    assembly.save().map_err(metadata_err)?;
    if windows_targeted {
        patcher.patch(path, &old_version, new_version)?;
    }

    Ok(Rewritten { path: path.to_path_buf(), old_version })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::mock::{AssemblyBuilder, RecordingPatcher};

    fn read_version(path: &Path) -> String {
        AssemblyFile::open(path).unwrap().informational_version().unwrap()
    }

    /// Patcher that records the version the on-disk file carries at the
    /// moment it is invoked.
    struct DiskVersionPatcher {
        seen: Mutex<Vec<String>>,
    }

    impl DiskVersionPatcher {
        fn new() -> Self {
            Self { seen: Mutex::new(Vec::new()) }
        }
    }

    impl ResourcePatcher for DiskVersionPatcher {
        fn patch(&self, path: &Path, _old: &str, _new: &str) -> Result<(), PatchError> {
            self.seen.lock().unwrap().push(read_version(path));
            Ok(())
        }
    }

    #[test]
    fn rewrites_binary_and_reports_old_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.dll");
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .write_to(&path)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = RecordingPatcher::new();
        let rewritten =
            rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher).unwrap();

        assert_eq!(rewritten.path, path);
        assert_eq!(rewritten.old_version, "1.3.0-build0054");
        assert_eq!(read_version(&path), "1.3.0");
        assert!(patcher.calls().is_empty());
    }

    #[test]
    fn referenced_binaries_are_validated_but_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("Couchbase.Lite.Listener.dll");
        let dep = dir.path().join("Couchbase.Lite.dll");
        AssemblyBuilder::new("Couchbase.Lite.Listener")
            .informational_version("1.3.0-build0054")
            .version_blob_padding(16)
            .assembly_ref("Couchbase.Lite")
            .assembly_ref("Newtonsoft.Json")
            .write_to(&root)
            .unwrap();
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .version_blob_padding(16)
            .write_to(&dep)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = RecordingPatcher::new();
        let rewritten =
            rewrite_version(&root, "1.3.0", "Couchbase", &mut resolver, &patcher).unwrap();

        assert_eq!(rewritten.path, root);
        assert_eq!(read_version(&root), "1.3.0");
        // the reference resolves, but its own rewrite belongs to its
        // own package pass
        assert_eq!(read_version(&dep), "1.3.0-build0054");
    }

    #[test]
    fn third_party_references_are_not_resolved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.dll");
        // Newtonsoft.Json exists nowhere on disk; the rewrite must not care.
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .version_blob_padding(16)
            .assembly_ref("Newtonsoft.Json")
            .write_to(&path)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = RecordingPatcher::new();
        rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher).unwrap();

        assert_eq!(read_version(&path), "1.3.0");
    }

    #[test]
    fn patches_native_resource_binaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.dll");
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .native_version_resource(true)
            .write_to(&path)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = RecordingPatcher::new();
        rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher).unwrap();

        let calls = patcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, path);
        assert_eq!(calls[0].old_version, "1.3.0-build0054");
        assert_eq!(calls[0].new_version, "1.3.0");
    }

    #[test]
    fn patch_runs_after_metadata_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.dll");
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .native_version_resource(true)
            .write_to(&path)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = DiskVersionPatcher::new();
        rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher).unwrap();

        // the helper works on the saved file, and nothing overwrites its
        // edits afterwards
        assert_eq!(*patcher.seen.lock().unwrap(), vec!["1.3.0".to_string()]);
    }

    #[test]
    fn patch_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.dll");
        AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0054")
            .native_version_resource(true)
            .write_to(&path)
            .unwrap();

        let mut resolver = AssemblyResolver::new(dir.path(), dir.path());
        let patcher = RecordingPatcher::failing();
        let result = rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher);

        assert!(matches!(result, Err(RewriteError::Patch(_))));
        // the metadata write precedes the patch step
        assert_eq!(read_version(&path), "1.3.0");
    }

    #[test]
    fn unresolvable_reference_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.Listener.dll");
        AssemblyBuilder::new("Couchbase.Lite.Listener")
            .informational_version("1.3.0-build0054")
            .assembly_ref("Couchbase.Lite")
            .write_to(&path)
            .unwrap();

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        let mut resolver = AssemblyResolver::new(&empty, &empty);
        let patcher = RecordingPatcher::new();
        let result = rewrite_version(&path, "1.3.0", "Couchbase", &mut resolver, &patcher);

        assert!(matches!(result, Err(RewriteError::Resolve(ResolveError::Unresolved(name))) if name == "Couchbase.Lite"));
        // validation failed before anything was written back
        assert_eq!(read_version(&path), "1.3.0-build0054");
    }
}
