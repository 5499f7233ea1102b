//! Cross-assembly reference resolution
//!
//! Rewriting one binary requires locating the assemblies it references:
//! siblings in the same platform directory, packages extracted alongside
//! it in the workspace, and a handful of SDK assemblies installed at
//! well-known paths outside the workspace entirely.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Platform tag whose packages were also published under an alternate
/// historical spelling.
const IOS_TAG: &str = "xamarinios10";
const IOS_TAG_ALTERNATE: &str = "Xamarin.iOS10";

/// Reference that never shipped under the alternate tag.
const ALTERNATE_EXCLUDED: &str = "Couchbase.Lite.Listener";

/// SDK assemblies resolved from fixed installation paths, independent of
/// the workspace being processed.
fn default_overrides() -> HashMap<String, PathBuf> {
    let mut overrides = HashMap::new();
    overrides.insert(
        "Xamarin.iOS".to_string(),
        PathBuf::from(
            "/Library/Frameworks/Xamarin.iOS.framework/Versions/Current/lib/64bits/Xamarin.iOS.dll",
        ),
    );
    overrides
}

/// Errors for reference resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unresolved assembly reference: {0}")]
    Unresolved(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A resolved assembly reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAssembly {
    pub name: String,
    pub path: PathBuf,
}

/// Locates referenced assemblies for one platform subtree.
///
/// Lookups try, in order: the platform directory itself, the override
/// table, then the `lib/<tag>/` tree of the first sibling package whose
/// directory name starts with the reference name — once per platform tag
/// in the resolver's ordered tag list. Successful resolutions are cached
/// for the lifetime of the resolver; a cached name never re-touches the
/// filesystem.
pub struct AssemblyResolver {
    base_dir: PathBuf,
    search_dir: PathBuf,
    platform_tags: Vec<String>,
    overrides: HashMap<String, PathBuf>,
    cache: HashMap<String, ResolvedAssembly>,
}

impl AssemblyResolver {
    /// Create a resolver scoped to a workspace and one of its platform
    /// directories (`<package>/lib/<tag>`).
    pub fn new(base_dir: &Path, platform_dir: &Path) -> Self {
        Self::with_overrides(base_dir, platform_dir, default_overrides())
    }

    /// Create a resolver with a custom name-to-path override table.
    pub fn with_overrides(
        base_dir: &Path,
        platform_dir: &Path,
        overrides: HashMap<String, PathBuf>,
    ) -> Self {
        let platform = platform_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut platform_tags = vec![platform.clone()];
        if platform == IOS_TAG {
            platform_tags.push(IOS_TAG_ALTERNATE.to_string());
        }

        Self {
            base_dir: base_dir.to_path_buf(),
            search_dir: platform_dir.to_path_buf(),
            platform_tags,
            overrides,
            cache: HashMap::new(),
        }
    }

    /// Whether `name` has an override-table entry.
    pub fn has_override(&self, name: &str) -> bool {
        self.overrides.contains_key(name)
    }

    /// Resolve a reference by assembly name.
    pub fn resolve(&mut self, name: &str) -> Result<ResolvedAssembly, ResolveError> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(hit.clone());
        }

        let resolved = self.locate(name)?;
        self.cache.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn locate(&self, name: &str) -> Result<ResolvedAssembly, ResolveError> {
        // Alongside the binaries currently being rewritten.
        let sibling = self.search_dir.join(format!("{name}.dll"));
        if sibling.is_file() {
            return Ok(ResolvedAssembly {
                name: name.to_string(),
                path: sibling,
            });
        }

        // SDK assemblies at fixed installation paths.
        if let Some(path) = self.overrides.get(name) {
            if path.is_file() {
                return Ok(ResolvedAssembly {
                    name: name.to_string(),
                    path: path.clone(),
                });
            }
        }

        // Sibling package directories, one pass per platform tag. The
        // excluded reference never shipped under the alternate tag, so it
        // only gets the primary pass.
        for (index, tag) in self.platform_tags.iter().enumerate() {
            if index > 0 && name == ALTERNATE_EXCLUDED {
                break;
            }
            if let Some(path) = self.scan_packages(name, tag)? {
                return Ok(ResolvedAssembly {
                    name: name.to_string(),
                    path,
                });
            }
        }

        Err(ResolveError::Unresolved(name.to_string()))
    }

    /// Search immediate subdirectories of the workspace whose name starts
    /// with the reference name for `lib/<tag>/<name>.dll`.
    fn scan_packages(&self, name: &str, tag: &str) -> Result<Option<PathBuf>, ResolveError> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if dir_name.starts_with(name) {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        for dir in candidates {
            let candidate = dir.join("lib").join(tag).join(format!("{name}.dll"));
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}
