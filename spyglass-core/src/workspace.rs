//! # Workspace Controller
//!
//! Saves and restores named snapshots of the application state, and tracks recently used
//! endpoints. Workspace operations are user initiated, so their failures are returned;
//! recents are maintained in the background and only logged when they fail.
use crate::connection::Endpoint;
use crate::state::AppState;
use crate::storage::{RequestSnapshot, Storage, StorageError, Workspace};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct WorkspaceController {
    storage: Storage,
}

impl WorkspaceController {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Captures the endpoint, the selection and the request under `name`.
    ///
    /// Fails with [`StorageError::WorkspaceExists`] when `name` is taken and `overwrite`
    /// is not set, so a front-end can ask before replacing it.
    pub async fn save(
        &self,
        name: &str,
        state: &AppState,
        overwrite: bool,
    ) -> Result<Workspace, StorageError> {
        let workspace = snapshot(name, state);
        self.storage.save_workspace(&workspace, overwrite).await?;

        tracing::debug!(workspace = name, "Saved workspace");
        Ok(workspace)
    }

    /// Restores workspace `name` into `state`.
    ///
    /// Connecting to the restored endpoint is left to the caller.
    pub async fn load(&self, name: &str, state: &AppState) -> Result<Workspace, StorageError> {
        let workspace = self.storage.load_workspace(name).await?;
        apply(&workspace, state);
        Ok(workspace)
    }

    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.storage.list_workspaces().await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.storage.delete_workspace(name).await
    }

    /// Recently used endpoints, newest first. Unreadable recents read as empty.
    pub async fn recents(&self) -> Vec<Endpoint> {
        self.storage.load_recents().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to load recent endpoints");
            Vec::new()
        })
    }

    pub async fn remember(&self, endpoint: &Endpoint) {
        if let Err(err) = self.storage.push_recent(endpoint).await {
            tracing::warn!(endpoint = %endpoint, error = %err, "Failed to record recent endpoint");
        }
    }
}

fn snapshot(name: &str, state: &AppState) -> Workspace {
    let request = state.request.get();
    let selected_service = state.selected_service.get();
    let selected_method = state.selected_method.get();

    Workspace {
        name: name.to_string(),
        endpoint: state.endpoint.get(),
        request: Some(RequestSnapshot {
            service: selected_service.clone(),
            method: selected_method.clone(),
            body: request.body,
            metadata: request.metadata,
        }),
        selected_service,
        selected_method,
        saved_at: Utc::now(),
    }
}

fn apply(workspace: &Workspace, state: &AppState) {
    state.endpoint.set(workspace.endpoint.clone());

    let request = workspace.request.as_ref();
    let service = workspace
        .selected_service
        .clone()
        .or_else(|| request.and_then(|r| r.service.clone()));
    let method = workspace
        .selected_method
        .clone()
        .or_else(|| request.and_then(|r| r.method.clone()));

    state.selected_service.set(service);
    state.selected_method.set(method);

    if let Some(request) = request {
        state.request.update(|current| {
            current.body = request.body.clone();
            current.metadata = request.metadata.clone();
        });
    }
}
