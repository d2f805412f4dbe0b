//! Blocking file helpers. Always called from the blocking pool.
use super::StorageError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Serializes `value` as pretty JSON and atomically replaces `path` with it.
///
/// The document is written to a sibling temporary file which is renamed over `path`.
/// If anything fails the temporary file is removed and `path` is left untouched.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::io(path, io::Error::other("path has no parent directory")))?;
    create_dir(dir)?;

    let mut json = serde_json::to_vec_pretty(value).map_err(|e| StorageError::format(path, e))?;
    json.push(b'\n');

    let mut file = NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    file.write_all(&json)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| StorageError::io(file.path(), e))?;
    set_file_mode(file.path())?;

    file.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;

    tracing::debug!(path = %path.display(), bytes = json.len(), "Stored file");
    Ok(())
}

/// Reads and parses `path`, `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| StorageError::format(path, e))
}

/// Removes `path`, returning whether it existed.
pub(crate) fn remove(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

pub(crate) fn create_dir(dir: &Path) -> Result<(), StorageError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }

    builder.create(dir).map_err(|e| StorageError::io(dir, e))
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .map_err(|e| StorageError::io(path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}
