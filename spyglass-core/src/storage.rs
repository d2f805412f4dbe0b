//! # Storage Repository
//!
//! Persists workspaces, recent endpoints and call history as pretty-printed JSON under a
//! base directory:
//!
//! ```text
//! <base>/workspaces/<name>.json
//! <base>/recent.json
//! <base>/history.json
//! ```
//!
//! Every write goes to a sibling temporary file that is renamed over the target, so readers
//! never observe a partially written document. All file work runs on tokio's blocking pool.
use crate::config::Settings;
use crate::connection::Endpoint;
use crate::error::ErrorKind;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod fs;
mod model;

pub use model::{CallRecord, CallStatus, RequestSnapshot, Workspace};

pub const MAX_RECENTS: usize = 10;
pub const MAX_HISTORY: usize = 100;

const WORKSPACES_DIR: &str = "workspaces";
const RECENT_FILE: &str = "recent.json";
const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to access '{}': '{source}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Failed to (de)serialize '{}': '{source}'", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("Invalid workspace name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Workspace '{0}' does not exist")]
    WorkspaceNotFound(String),

    #[error("Workspace '{0}' already exists")]
    WorkspaceExists(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io { .. } | StorageError::Format { .. } => ErrorKind::StorageIo,
            StorageError::InvalidName { .. }
            | StorageError::WorkspaceNotFound(_)
            | StorageError::WorkspaceExists(_) => ErrorKind::Validation,
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn format(path: &Path, source: serde_json::Error) -> Self {
        StorageError::Format {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

/// Checks that `name` can be used as a workspace file name.
///
/// Names must be non-empty and may not contain NUL, `/`, `\` or `..`.
pub fn validate_workspace_name(name: &str) -> Result<(), StorageError> {
    let reason = if name.trim().is_empty() {
        Some("the name is empty")
    } else if name.contains('\0') {
        Some("the name contains a NUL character")
    } else if name.contains('/') || name.contains('\\') {
        Some("the name contains a path separator")
    } else if name.contains("..") || name == "." {
        Some("the name contains a relative path segment")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.data_dir.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_workspace_name(name)?;
        Ok(self.root.join(WORKSPACES_DIR).join(format!("{name}.json")))
    }

    /// Writes a workspace.
    ///
    /// # Arguments
    ///
    /// * `workspace` - The workspace, stored under its own name.
    /// * `overwrite` - Replace an existing workspace with the same name. Without it a
    ///   collision fails with [`StorageError::WorkspaceExists`].
    pub async fn save_workspace(
        &self,
        workspace: &Workspace,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let path = self.workspace_path(&workspace.name)?;
        let workspace = workspace.clone();

        blocking(move || {
            if !overwrite && path.exists() {
                return Err(StorageError::WorkspaceExists(workspace.name));
            }
            fs::write_json(&path, &workspace)
        })
        .await
    }

    pub async fn load_workspace(&self, name: &str) -> Result<Workspace, StorageError> {
        let path = self.workspace_path(name)?;
        let name = name.to_string();

        blocking(move || fs::read_json(&path)?.ok_or(StorageError::WorkspaceNotFound(name))).await
    }

    /// Names of every stored workspace, sorted lexicographically.
    pub async fn list_workspaces(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(WORKSPACES_DIR);

        blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::io(&dir, e)),
            };

            let mut names = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| StorageError::io(&dir, e))?.path();
                if path.extension().is_some_and(|ext| ext == "json")
                    && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                {
                    names.push(stem.to_string());
                }
            }

            names.sort();
            Ok(names)
        })
        .await
    }

    pub async fn delete_workspace(&self, name: &str) -> Result<(), StorageError> {
        let path = self.workspace_path(name)?;
        let name = name.to_string();

        blocking(move || match fs::remove(&path)? {
            true => Ok(()),
            false => Err(StorageError::WorkspaceNotFound(name)),
        })
        .await
    }

    /// Recently used endpoints, newest first.
    pub async fn load_recents(&self) -> Result<Vec<Endpoint>, StorageError> {
        let path = self.root.join(RECENT_FILE);
        blocking(move || Ok(fs::read_json(&path)?.unwrap_or_default())).await
    }

    /// Moves `endpoint` to the front of the recents list and returns the new list.
    ///
    /// Entries are deduplicated on address and TLS flag, and the list is capped at
    /// [`MAX_RECENTS`].
    pub async fn push_recent(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>, StorageError> {
        let path = self.root.join(RECENT_FILE);
        let endpoint = endpoint.clone();

        blocking(move || {
            let mut recents: Vec<Endpoint> = match fs::read_json(&path) {
                Ok(recents) => recents.unwrap_or_default(),
                Err(StorageError::Format { .. }) => {
                    tracing::warn!(path = %path.display(), "Discarding unreadable recents file");
                    Vec::new()
                }
                Err(e) => return Err(e),
            };

            recents.retain(|existing| !existing.same_target(&endpoint));
            recents.insert(0, endpoint);
            recents.truncate(MAX_RECENTS);

            fs::write_json(&path, &recents)?;
            Ok(recents)
        })
        .await
    }

    /// Call history, newest first.
    pub async fn load_history(&self) -> Result<Vec<CallRecord>, StorageError> {
        let path = self.root.join(HISTORY_FILE);
        blocking(move || Ok(fs::read_json(&path)?.unwrap_or_default())).await
    }

    /// Replaces the stored history. Duplicate ids keep their first occurrence and the list
    /// is capped at [`MAX_HISTORY`].
    pub async fn save_history(&self, records: &[CallRecord]) -> Result<(), StorageError> {
        let path = self.root.join(HISTORY_FILE);
        let records = normalize_history(records.to_vec());

        blocking(move || fs::write_json(&path, &records)).await
    }
}

pub(crate) fn normalize_history(records: Vec<CallRecord>) -> Vec<CallRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut records: Vec<_> = records
        .into_iter()
        .filter(|record| seen.insert(record.id))
        .collect();
    records.truncate(MAX_HISTORY);
    records
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::io(Path::new(""), io::Error::other(e)))?
}
