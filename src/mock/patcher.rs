use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::rewrite::{PatchError, ResourcePatcher};

/// One recorded patch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCall {
    pub path: PathBuf,
    pub old_version: String,
    pub new_version: String,
}

/// Patcher that records every invocation instead of touching the binary.
#[derive(Default)]
pub struct RecordingPatcher {
    calls: Mutex<Vec<PatchCall>>,
    fail: bool,
}

impl RecordingPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patcher whose every invocation fails.
    pub fn failing() -> Self {
        Self { calls: Mutex::new(Vec::new()), fail: true }
    }

    pub fn calls(&self) -> Vec<PatchCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ResourcePatcher for RecordingPatcher {
    fn patch(&self, path: &Path, old_version: &str, new_version: &str) -> Result<(), PatchError> {
        if self.fail {
            return Err(PatchError::Spawn {
                helper: "mock".into(),
                source: io::Error::other("injected failure"),
            });
        }
        self.calls.lock().unwrap().push(PatchCall {
            path: path.to_path_buf(),
            old_version: old_version.to_string(),
            new_version: new_version.to_string(),
        });
        Ok(())
    }
}
