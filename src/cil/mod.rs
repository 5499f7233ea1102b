//! .NET binary metadata codec
//!
//! Reads and rewrites the informational-version custom attribute embedded
//! in a managed binary. The attribute value blob is patched in place —
//! same declared blob size, zero-padded — so the rest of the image is
//! byte-for-byte untouched and no heap or table needs rebuilding. A
//! replacement longer than the original blob cannot be expressed this
//! way and is rejected; promotion strips build qualifiers, so release
//! versions are never longer than the pre-release ones they replace.

mod pe;
mod tables;

use std::fs;
use std::path::{Path, PathBuf};

/// Errors for metadata operations
#[derive(Debug, thiserror::Error)]
pub enum CilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed assembly image: {0}")]
    Malformed(&'static str),

    #[error("no informational version attribute")]
    MissingVersionAttribute,

    #[error("replacement version does not fit the attribute blob: {version}")]
    VersionTooLong { version: String },
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8, CilError> {
    data.get(offset)
        .copied()
        .ok_or(CilError::Malformed("truncated image"))
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16, CilError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(CilError::Malformed("truncated image"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, CilError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(CilError::Malformed("truncated image"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64, CilError> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(CilError::Malformed("truncated image"))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// One managed binary, loaded in full for offset-based metadata access.
pub struct AssemblyFile {
    path: PathBuf,
    data: Vec<u8>,
}

impl AssemblyFile {
    /// Load and validate a managed binary.
    pub fn open(path: &Path) -> Result<Self, CilError> {
        let data = fs::read(path)?;
        let pe = pe::parse(&data)?;
        tables::parse(&data, &pe)?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded informational version.
    pub fn informational_version(&self) -> Result<String, CilError> {
        let pe = pe::parse(&self.data)?;
        let metadata = tables::parse(&self.data, &pe)?;
        let entry = metadata.informational_version_blob(&self.data)?;
        let (value, _) = metadata.read_version_blob(&self.data, entry)?;
        Ok(value)
    }

    /// Replace the informational version, returning the previous value.
    pub fn set_informational_version(&mut self, new_version: &str) -> Result<String, CilError> {
        let pe = pe::parse(&self.data)?;
        let metadata = tables::parse(&self.data, &pe)?;
        let entry = metadata.informational_version_blob(&self.data)?;
        let (old_version, span) = metadata.read_version_blob(&self.data, entry)?;
        metadata.write_version_blob(&mut self.data, span, new_version)?;
        Ok(old_version)
    }

    /// Names of every assembly this binary references.
    pub fn assembly_refs(&self) -> Result<Vec<String>, CilError> {
        let pe = pe::parse(&self.data)?;
        let metadata = tables::parse(&self.data, &pe)?;
        metadata.assembly_ref_names(&self.data)
    }

    /// Whether the image carries a native resource directory (the version
    /// block the external patch helper rewrites).
    pub fn has_native_version_resource(&self) -> Result<bool, CilError> {
        Ok(pe::parse(&self.data)?.has_resource_dir)
    }

    /// Persist the image back to the path it was opened from.
    pub fn save(&self) -> Result<(), CilError> {
        fs::write(&self.path, &self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::AssemblyBuilder;
    use tempfile::TempDir;

    fn write_assembly(dir: &Path, builder: AssemblyBuilder) -> PathBuf {
        let path = dir.join("Couchbase.Lite.dll");
        builder.write_to(&path).unwrap();
        path
    }

    #[test]
    fn test_reads_informational_version() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite").informational_version("1.3.0-build0100"),
        );

        let assembly = AssemblyFile::open(&path).unwrap();
        assert_eq!(assembly.informational_version().unwrap(), "1.3.0-build0100");
    }

    #[test]
    fn test_rewrite_returns_old_and_persists_new() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite").informational_version("1.3.0-build0100"),
        );

        let mut assembly = AssemblyFile::open(&path).unwrap();
        let old = assembly.set_informational_version("1.3.0").unwrap();
        assert_eq!(old, "1.3.0-build0100");
        assembly.save().unwrap();

        let reread = AssemblyFile::open(&path).unwrap();
        assert_eq!(reread.informational_version().unwrap(), "1.3.0");
    }

    #[test]
    fn test_missing_attribute_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(dir.path(), AssemblyBuilder::new("Couchbase.Lite"));

        let assembly = AssemblyFile::open(&path).unwrap();
        let err = assembly.informational_version().unwrap_err();
        assert!(matches!(err, CilError::MissingVersionAttribute));
    }

    #[test]
    fn test_longer_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite").informational_version("1.3.0"),
        );

        let mut assembly = AssemblyFile::open(&path).unwrap();
        let err = assembly
            .set_informational_version("1.3.0-much-longer-than-before")
            .unwrap_err();
        assert!(matches!(err, CilError::VersionTooLong { .. }));
    }

    #[test]
    fn test_longer_version_fits_reserved_padding() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite")
                .informational_version("1.3.0")
                .version_blob_padding(32),
        );

        let mut assembly = AssemblyFile::open(&path).unwrap();
        assembly
            .set_informational_version("1.3.0-rebuilt0200")
            .unwrap();
        assembly.save().unwrap();

        let reread = AssemblyFile::open(&path).unwrap();
        assert_eq!(reread.informational_version().unwrap(), "1.3.0-rebuilt0200");
    }

    #[test]
    fn test_lists_assembly_refs() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite.Listener")
                .informational_version("1.3.0-build0100")
                .assembly_ref("Couchbase.Lite"),
        );

        let assembly = AssemblyFile::open(&path).unwrap();
        let refs = assembly.assembly_refs().unwrap();
        assert_eq!(refs, vec!["mscorlib".to_string(), "Couchbase.Lite".to_string()]);
    }

    #[test]
    fn test_rewrite_touches_nothing_else() {
        let dir = TempDir::new().unwrap();
        let path = write_assembly(
            dir.path(),
            AssemblyBuilder::new("Couchbase.Lite").informational_version("1.3.0-build0100"),
        );
        let before = fs::read(&path).unwrap();

        let mut assembly = AssemblyFile::open(&path).unwrap();
        assembly.set_informational_version("1.3.0").unwrap();
        assembly.save().unwrap();

        let after = fs::read(&path).unwrap();
        assert_eq!(before.len(), after.len());
        let differing = before
            .iter()
            .zip(&after)
            .filter(|(a, b)| a != b)
            .count();
        // Only bytes inside the attribute value blob may change.
        assert!(differing <= "1.3.0-build0100".len() + 4);
    }
}
