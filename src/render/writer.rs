//! Atomic placement of generated files
//!
//! Content goes to a temporary file in the destination directory and is then
//! moved into place, so readers never observe a half-written file.

use crate::core::error::PipelineError;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

fn stage_temp(path: &Path, contents: &str) -> Result<NamedTempFile, PipelineError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| PipelineError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| PipelineError::io(tmp.path(), e))?;
    Ok(tmp)
}

/// Write `contents` to `path`, replacing any existing file
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), PipelineError> {
    let tmp = stage_temp(path, contents)?;
    tmp.persist(path)
        .map_err(|e| PipelineError::io(path, e.error))?;
    debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

/// Write `contents` to `path` only if nothing is there yet.
///
/// Fails with `AlreadyRunning` if the file exists, including when another
/// run placed it between our check and our write.
pub fn write_new_atomic(path: &Path, contents: &str) -> Result<(), PipelineError> {
    if path.exists() {
        return Err(PipelineError::AlreadyRunning {
            path: path.to_path_buf(),
        });
    }
    let tmp = stage_temp(path, contents)?;
    tmp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            PipelineError::AlreadyRunning {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::io(path, e.error)
        }
    })?;
    debug!("Placed {} ({} bytes)", path.display(), contents.len());
    Ok(())
}
