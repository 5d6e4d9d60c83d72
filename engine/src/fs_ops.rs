//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Creating the destination directory
//! - Opening (or reusing) the temp artifact
//! - Renaming the temp artifact into place
//! - Discarding partial artifacts

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::error::EngineError;

/// Temp artifact opened for writing, positioned at its end.
#[derive(Debug)]
pub struct TempArtifact {
    pub path: PathBuf,
    pub file: File,
    /// Bytes already present when the file was opened
    pub existing_len: u64,
}

impl TempArtifact {
    /// Drop all existing content and rewind.
    pub fn truncate(&mut self) -> Result<(), EngineError> {
        let write_error = |source| EngineError::WriteError {
            path: self.path.clone(),
            source,
        };
        self.file.set_len(0).map_err(write_error)?;
        self.file.seek(SeekFrom::Start(0)).map_err(write_error)?;
        self.existing_len = 0;
        Ok(())
    }

    /// Flush written bytes to stable storage.
    pub fn sync(&self) -> Result<(), EngineError> {
        self.file.sync_data().map_err(|source| EngineError::WriteError {
            path: self.path.clone(),
            source,
        })
    }
}

/// Ensure a directory exists, creating it recursively if necessary.
///
/// # Errors
/// Returns EngineError if the path exists but is not a directory, or if
/// creation fails
pub fn ensure_dir_exists(path: &Path) -> Result<(), EngineError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| EngineError::DirectoryCreationFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Open the temp artifact for appending.
///
/// With `reuse_existing`, bytes already in the file are kept and reported in
/// `existing_len`; otherwise the file is truncated.
pub fn open_temp_artifact(path: &Path, reuse_existing: bool) -> Result<TempArtifact, EngineError> {
    let write_error = |source| EngineError::WriteError {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(!reuse_existing)
        .open(path)
        .map_err(write_error)?;
    let existing_len = file.seek(SeekFrom::End(0)).map_err(write_error)?;

    Ok(TempArtifact {
        path: path.to_path_buf(),
        file,
        existing_len,
    })
}

/// Atomically move the finished temp artifact to its final path.
pub fn finalize_artifact(temp: &Path, final_path: &Path) -> Result<(), EngineError> {
    fs::rename(temp, final_path).map_err(|e| EngineError::FinalizeFailed {
        from: temp.to_path_buf(),
        to: final_path.to_path_buf(),
        source: e,
    })
}

/// Remove a partial artifact. A missing file is not an error.
pub fn discard_artifact(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Stamp the artifact with the source's modification time. Best effort.
pub fn preserve_mtime(path: &Path, mtime: SystemTime) {
    if let Err(e) = filetime::set_file_mtime(path, filetime::FileTime::from_system_time(mtime)) {
        warn!(path = %path.display(), error = %e, "Failed to set modification time");
    }
}
