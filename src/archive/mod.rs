//! Package archive extraction and reconstruction
//!
//! NuGet packages are plain zip archives. Extraction unpacks one package
//! into a working directory, optionally stripping debug symbols and the
//! source mirror; reconstruction walks a working directory back into a
//! deflated archive with relative entry names and preserved timestamps.

mod filter;

pub use filter::{FilterError, FilterRules};

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Deflate level used when rebuilding packages. Moderate on purpose:
/// promotion handles a handful of archives per run and throughput matters
/// more than the last few percent of compression.
const COMPRESSION_LEVEL: i64 = 6;

/// Errors for archive operations
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("entry escapes extraction root: {name}")]
    EntryEscapesRoot { name: String },

    #[error("path is not under the source root: {0}")]
    PathOutsideRoot(PathBuf),

    #[error("filter rules error: {0}")]
    Filter(#[from] FilterError),
}

/// Extraction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// Write every entry verbatim
    #[default]
    Full,
    /// Skip debug-symbol and source-mirror content
    StripSymbols,
}

/// Unpack `source` into `target`, creating directories as needed.
///
/// Directory-marker entries are skipped; directories appear lazily as
/// files are written into them. Entries whose names would land outside
/// `target` are rejected. In [`ExtractMode::StripSymbols`] mode the
/// symbol filter rules apply and any `src` directory left at the target
/// root is removed afterwards.
pub fn extract(source: &Path, target: &Path, mode: ExtractMode) -> Result<(), ArchiveError> {
    let rules = match mode {
        ExtractMode::Full => None,
        ExtractMode::StripSymbols => Some(FilterRules::new()?),
    };

    let mut archive = ZipArchive::new(File::open(source)?)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }

        let rel = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::EntryEscapesRoot {
                name: entry.name().to_string(),
            })?;

        if let Some(rules) = &rules {
            if rules.is_excluded(&rel) {
                continue;
            }
        }

        let dest = target.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
    }

    if mode == ExtractMode::StripSymbols {
        let src_dir = target.join("src");
        if src_dir.is_dir() {
            fs::remove_dir_all(&src_dir)?;
        }
    }

    Ok(())
}

/// Rebuild `source_dir` into a zip archive at `target`, overwriting any
/// existing file there.
///
/// Entry names are the forward-slash-normalized paths relative to
/// `source_dir`, walked in sorted order so repeated builds from the same
/// tree produce the same entry set. File timestamps are carried over at
/// the zip format's 2-second granularity.
pub fn build(source_dir: &Path, target: &Path) -> Result<(), ArchiveError> {
    let mut writer = ZipWriter::new(File::create(target)?);

    for entry in WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(|e| ArchiveError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|_| ArchiveError::PathOutsideRoot(entry.path().to_path_buf()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(COMPRESSION_LEVEL));
        if let Some(modified) = entry_mtime(entry.path()) {
            options = options.last_modified_time(modified);
        }

        writer.start_file(name, options)?;
        let mut input = File::open(entry.path())?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

/// Last-modified time of a file as a zip timestamp, or `None` when the
/// format cannot represent it.
fn entry_mtime(path: &Path) -> Option<zip::DateTime> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}
