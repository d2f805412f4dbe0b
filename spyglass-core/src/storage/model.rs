use crate::Metadata;
use crate::connection::Endpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Request editor contents captured by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub service: Option<String>,
    pub method: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A named snapshot of the session: endpoint, selection and request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub endpoint: Option<Endpoint>,
    pub request: Option<RequestSnapshot>,
    pub selected_service: Option<String>,
    pub selected_method: Option<String>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// One completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub endpoint: Option<Endpoint>,
    /// Fully-qualified method, `package.Service/Method`.
    pub method: String,
    pub request: String,
    pub response: String,
    pub duration_ms: u64,
    pub status: CallStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub request_metadata: Metadata,
    #[serde(default)]
    pub response_metadata: Metadata,
}

impl CallRecord {
    /// Starts a record for a call to `method` with the given request text.
    pub fn new(endpoint: Option<Endpoint>, method: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            endpoint,
            method: method.into(),
            request: request.into(),
            response: String::new(),
            duration_ms: 0,
            status: CallStatus::Success,
            error: None,
            request_metadata: Vec::new(),
            response_metadata: Vec::new(),
        }
    }

    pub fn with_request_metadata(mut self, metadata: Metadata) -> Self {
        self.request_metadata = metadata;
        self
    }

    pub fn succeeded(mut self, response: String, metadata: Metadata, duration: Duration) -> Self {
        self.status = CallStatus::Success;
        self.response = response;
        self.response_metadata = metadata;
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn failed(mut self, error: String, duration: Duration) -> Self {
        self.status = CallStatus::Error;
        self.error = Some(error);
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}
