//! Pipeline orchestration for package promotion
//!
//! This module implements the full promotion pipeline:
//! - Extract every package in the input directory into a scratch workspace
//! - Correct the manifest version
//! - Rewrite informational versions in product binaries, patching
//!   native version resources where present
//! - Optionally split symbol content into a companion package
//! - Rebuild the archives under their release names
//!
//! It also implements the read-only verify pass, which reports the
//! informational version of every product binary inside a package.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::archive::{self, ArchiveError, ExtractMode};
use crate::cil::{AssemblyFile, CilError};
use crate::manifest::{correct_manifest, ManifestError};
use crate::resolver::AssemblyResolver;
use crate::rewrite::{rewrite_version, ResourcePatcher, RewriteError};

/// File extension of the packages being promoted
pub const PACKAGE_EXTENSION: &str = "nupkg";

/// Suffix marking a symbols subtree in the workspace
pub const SYMBOLS_MARKER: &str = "-symbols";

/// Product binaries start with this prefix unless configured otherwise
pub const DEFAULT_BINARY_PREFIX: &str = "Couchbase";

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("rewrite error: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("failed to read metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: CilError,
    },

    #[error("expected exactly one .nuspec manifest in {dir}, found {found}")]
    BadManifestCount { dir: PathBuf, found: usize },

    #[error("binaries in {package} disagree on the current version: {first} vs {conflicting}")]
    VersionDisagreement {
        package: PathBuf,
        first: String,
        conflicting: String,
    },
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Release version written into manifests and binaries
    pub version: String,

    /// Directory holding the packages to promote
    pub directory: PathBuf,

    /// Split symbol content into a companion `.symbols` package
    pub split_symbols: bool,

    /// Scratch workspace override; a per-user default is used when unset
    pub workspace: Option<PathBuf>,

    /// Prefix identifying product binaries
    pub binary_prefix: String,
}

impl PipelineConfig {
    pub fn new(version: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            directory: directory.into(),
            split_symbols: false,
            workspace: None,
            binary_prefix: DEFAULT_BINARY_PREFIX.to_string(),
        }
    }
}

/// Default scratch location, recreated fresh on every run
pub fn default_workspace_root() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(".cache/nupkg-promote"),
        Err(_) => std::env::temp_dir().join("nupkg-promote"),
    }
}

/// Scratch directory that is wiped on creation and again on drop, so
/// extracted package content never outlives the run.
struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn create(root: PathBuf) -> io::Result<Self> {
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self) -> &Path {
        &self.root
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// One extracted package subtree awaiting processing
struct Subtree {
    dir: PathBuf,
    symbols: bool,
}

/// Promotion pipeline
pub struct Pipeline {
    config: PipelineConfig,
    patcher: Arc<dyn ResourcePatcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, patcher: Arc<dyn ResourcePatcher>) -> Self {
        Self { config, patcher }
    }

    /// Promote every package in the configured directory. Returns the
    /// paths of the archives written, in processing order.
    pub fn promote(&self) -> PipelineResult<Vec<PathBuf>> {
        let workspace =
            Workspace::create(self.config.workspace.clone().unwrap_or_else(default_workspace_root))?;

        let mut subtrees = Vec::new();
        for package in packages_in(&self.config.directory)? {
            let base = package
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let primary = workspace.path().join(&base);
            if self.config.split_symbols {
                archive::extract(&package, &primary, ExtractMode::StripSymbols)?;
                let symbols = workspace.path().join(format!("{base}{SYMBOLS_MARKER}"));
                archive::extract(&package, &symbols, ExtractMode::Full)?;
                subtrees.push(Subtree { dir: primary, symbols: false });
                subtrees.push(Subtree { dir: symbols, symbols: true });
            } else {
                archive::extract(&package, &primary, ExtractMode::Full)?;
                subtrees.push(Subtree { dir: primary, symbols: false });
            }
        }

        let mut outputs = Vec::new();
        for subtree in &subtrees {
            let old_version = self.process_subtree(workspace.path(), &subtree.dir)?;
            let dir_name = subtree.dir.file_name().unwrap_or_default().to_string_lossy();
            let name = output_name(&dir_name, &old_version, &self.config.version, subtree.symbols);
            let target = self.config.directory.join(name);
            archive::build(&subtree.dir, &target)?;
            outputs.push(target);
        }
        Ok(outputs)
    }

    /// Correct the manifest and rewrite every product binary under the
    /// subtree. Returns the version the package carried before.
    fn process_subtree(&self, workspace: &Path, dir: &Path) -> PipelineResult<String> {
        let manifest = find_manifest(dir)?;
        let manifest_version = correct_manifest(&manifest, &self.config.version)?;

        let mut old_version: Option<String> = None;
        for platform_dir in platform_dirs(dir)? {
            let mut resolver = AssemblyResolver::new(workspace, &platform_dir);
            for binary in matching_binaries(&platform_dir, &self.config.binary_prefix)? {
                let rewritten = rewrite_version(
                    &binary,
                    &self.config.version,
                    &self.config.binary_prefix,
                    &mut resolver,
                    self.patcher.as_ref(),
                )?;
                match &old_version {
                    None => old_version = Some(rewritten.old_version),
                    Some(first) if *first != rewritten.old_version => {
                        return Err(PipelineError::VersionDisagreement {
                            package: dir.to_path_buf(),
                            first: first.clone(),
                            conflicting: rewritten.old_version,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        // A package with no binaries still renames by its manifest version
        Ok(old_version.unwrap_or(manifest_version))
    }
}

/// Read-only verification of a promoted package
pub struct Verifier {
    binary_prefix: String,
    workspace: Option<PathBuf>,
}

/// Version report for one binary inside a verified package
#[derive(Debug, Clone)]
pub struct BinaryReport {
    /// Path relative to the package root
    pub path: PathBuf,
    pub version: String,
    /// Verdict against the expected version, when one was supplied
    pub matches: Option<bool>,
}

impl Verifier {
    pub fn new() -> Self {
        Self { binary_prefix: DEFAULT_BINARY_PREFIX.to_string(), workspace: None }
    }

    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace = Some(root.into());
        self
    }

    /// Extract `package` into the workspace and report the informational
    /// version of every product binary. Nothing is written back.
    pub fn verify(
        &self,
        package: &Path,
        expected_version: Option<&str>,
    ) -> PipelineResult<Vec<BinaryReport>> {
        let workspace =
            Workspace::create(self.workspace.clone().unwrap_or_else(default_workspace_root))?;
        let base = package
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = workspace.path().join(base);
        archive::extract(package, &root, ExtractMode::Full)?;

        let mut reports = Vec::new();
        for platform_dir in platform_dirs(&root)? {
            for binary in matching_binaries(&platform_dir, &self.binary_prefix)? {
                let assembly = AssemblyFile::open(&binary).map_err(|source| {
                    PipelineError::Metadata { path: binary.clone(), source }
                })?;
                let version = assembly.informational_version().map_err(|source| {
                    PipelineError::Metadata { path: binary.clone(), source }
                })?;
                let relative = binary.strip_prefix(&root).unwrap_or(&binary).to_path_buf();
                reports.push(BinaryReport {
                    path: relative,
                    matches: expected_version.map(|expected| version == expected),
                    version,
                });
            }
        }
        Ok(reports)
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Packages in `dir`, sorted by file name.
fn packages_in(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut packages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == PACKAGE_EXTENSION) {
            packages.push(path);
        }
    }
    packages.sort();
    Ok(packages)
}

/// The single manifest at the top of a package subtree.
fn find_manifest(dir: &Path) -> PipelineResult<PathBuf> {
    let mut manifests = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "nuspec") {
            manifests.push(path);
        }
    }
    match manifests.len() {
        1 => Ok(manifests.remove(0)),
        found => Err(PipelineError::BadManifestCount { dir: dir.to_path_buf(), found }),
    }
}

/// Platform directories under `<subtree>/lib`, sorted. A subtree without
/// a lib directory has no binaries to rewrite.
fn platform_dirs(subtree: &Path) -> io::Result<Vec<PathBuf>> {
    let lib = subtree.join("lib");
    if !lib.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(lib)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Product binaries directly inside a platform directory, sorted.
fn matching_binaries(platform_dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut binaries = Vec::new();
    for entry in fs::read_dir(platform_dir)? {
        let path = entry?.path();
        let is_dll = path.extension().is_some_and(|e| e == "dll");
        let named = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(prefix))
            .unwrap_or(false);
        if path.is_file() && is_dll && named {
            binaries.push(path);
        }
    }
    binaries.sort();
    Ok(binaries)
}

/// Release file name for a processed subtree: the old version in the
/// directory name gives way to the new one, and symbols subtrees trade
/// their workspace marker for a `.symbols` qualifier.
fn output_name(subtree_name: &str, old_version: &str, new_version: &str, symbols: bool) -> String {
    if symbols {
        let base = subtree_name.strip_suffix(SYMBOLS_MARKER).unwrap_or(subtree_name);
        format!("{}.symbols.{PACKAGE_EXTENSION}", base.replace(old_version, new_version))
    } else {
        format!("{}.{PACKAGE_EXTENSION}", subtree_name.replace(old_version, new_version))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn output_name_swaps_version() {
        assert_eq!(
            output_name("Couchbase.Lite.1.3.0-build0100", "1.3.0-build0100", "1.3.0", false),
            "Couchbase.Lite.1.3.0.nupkg"
        );
    }

    #[test]
    fn output_name_keeps_unrelated_text() {
        assert_eq!(
            output_name("Couchbase.Lite.Listener.1.3.0-build0100", "1.3.0-build0100", "1.3.1", false),
            "Couchbase.Lite.Listener.1.3.1.nupkg"
        );
    }

    #[test]
    fn output_name_qualifies_symbols() {
        assert_eq!(
            output_name("Couchbase.Lite.1.3.0-build0100-symbols", "1.3.0-build0100", "1.3.0", true),
            "Couchbase.Lite.1.3.0.symbols.nupkg"
        );
    }

    #[test]
    fn workspace_recreated_and_removed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scratch");
        fs::create_dir_all(root.join("stale")).unwrap();

        {
            let workspace = Workspace::create(root.clone()).unwrap();
            assert!(workspace.path().is_dir());
            assert!(!workspace.path().join("stale").exists());
        }
        assert!(!root.exists());
    }

    #[test]
    fn manifest_lookup_requires_exactly_one() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            find_manifest(dir.path()),
            Err(PipelineError::BadManifestCount { found: 0, .. })
        ));

        fs::write(dir.path().join("a.nuspec"), "x").unwrap();
        assert!(find_manifest(dir.path()).is_ok());

        fs::write(dir.path().join("b.nuspec"), "x").unwrap();
        assert!(matches!(
            find_manifest(dir.path()),
            Err(PipelineError::BadManifestCount { found: 2, .. })
        ));
    }
}
