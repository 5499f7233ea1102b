//! Package manifest correction
//!
//! Each extracted package carries exactly one `.nuspec` descriptor whose
//! `<version>` element records the pre-release version being promoted.

use regex_lite::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const VERSION_ELEMENT: &str = "<version>(.*?)</version>";

/// Errors for manifest correction
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no <version> element in {0}")]
    MissingVersion(PathBuf),
}

/// Replace the declared version in the manifest at `path` with
/// `new_version`, returning the version that was there before.
///
/// Every literal occurrence of the old version is replaced, not just the
/// one inside the version element: dependency pins and release-notes
/// links elsewhere in the manifest repeat the version string and must
/// move with it.
pub fn correct_manifest(path: &Path, new_version: &str) -> Result<String, ManifestError> {
    let text = fs::read_to_string(path)?;

    let pattern = Regex::new(VERSION_ELEMENT).expect("version pattern compiles");
    let old_version = pattern
        .captures(&text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ManifestError::MissingVersion(path.to_path_buf()))?;

    let corrected = text.replace(&old_version, new_version);
    fs::write(path, corrected)?;

    Ok(old_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0"?>
<package>
  <metadata>
    <id>Couchbase.Lite</id>
    <version>1.3.0-build0100</version>
    <dependencies>
      <dependency id="Couchbase.Lite.Storage" version="1.3.0-build0100" />
    </dependencies>
  </metadata>
</package>
"#;

    #[test]
    fn test_replaces_every_occurrence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Couchbase.Lite.nuspec");
        fs::write(&path, MANIFEST).unwrap();

        let old = correct_manifest(&path, "1.3.0").unwrap();
        assert_eq!(old, "1.3.0-build0100");

        let corrected = fs::read_to_string(&path).unwrap();
        assert!(!corrected.contains("1.3.0-build0100"));
        assert!(corrected.contains("<version>1.3.0</version>"));
        assert!(corrected.contains(r#"version="1.3.0""#));
    }

    #[test]
    fn test_missing_version_element_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.nuspec");
        fs::write(&path, "<package><metadata/></package>").unwrap();

        let err = correct_manifest(&path, "1.3.0").unwrap_err();
        assert!(matches!(err, ManifestError::MissingVersion(_)));
    }

    #[test]
    fn test_empty_version_element_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.nuspec");
        fs::write(&path, "<package><version></version></package>").unwrap();

        let err = correct_manifest(&path, "1.3.0").unwrap_err();
        assert!(matches!(err, ManifestError::MissingVersion(_)));
    }
}
