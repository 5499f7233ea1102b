//! Filter rules for symbol-stripped extraction
//!
//! Release packages drop the debug artifacts that symbol packages keep.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Content excluded from release packages: debug symbol files and the
/// source mirror that symbol packages carry at the archive root.
const SYMBOL_EXCLUDES: &[&str] = &[
    "**/*.pdb",
    "**/*.mdb",
    "src",
    "src/**",
];

/// Errors for filter rules
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),
}

/// Exclusion rules applied while extracting a release package
#[derive(Debug)]
pub struct FilterRules {
    glob_set: GlobSet,
}

impl FilterRules {
    /// Create the symbol-stripping rule set
    pub fn new() -> Result<Self, FilterError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in SYMBOL_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            glob_set: builder.build()?,
        })
    }

    /// Check whether a relative archive path is excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.glob_set.is_match(path)
    }
}
