//! # History Controller
//!
//! Keeps the call history in memory, newest first, and mirrors it to storage after every
//! change. Storage failures are logged and swallowed: the in-memory history stays usable.
use crate::connection::Endpoint;
use crate::invoker::CallSummary;
use crate::state::AppState;
use crate::storage::{CallRecord, CallStatus, MAX_HISTORY, Storage};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Case-insensitive substring over method, request body and error text.
    pub query: Option<String>,
    pub status: Option<CallStatus>,
}

impl HistoryFilter {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &CallRecord) -> bool {
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }

        let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
            return true;
        };
        let query = query.to_lowercase();

        [
            Some(record.method.as_str()),
            Some(record.request.as_str()),
            record.error.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|text| text.to_lowercase().contains(&query))
    }
}

/// Builds the history entry for a finished call.
pub fn record_from_summary(endpoint: Option<Endpoint>, summary: CallSummary) -> CallRecord {
    let record = CallRecord::new(endpoint, summary.method, summary.request)
        .with_request_metadata(summary.request_metadata);

    match summary.error {
        None => record.succeeded(
            summary.response.unwrap_or_default(),
            summary.response_metadata,
            summary.duration,
        ),
        Some(err) => {
            let mut record = record.failed(err.to_string(), summary.duration);
            record.response = summary.response.unwrap_or_default();
            record.response_metadata = summary.response_metadata;
            record
        }
    }
}

pub struct HistoryController {
    storage: Storage,
    records: RwLock<Vec<CallRecord>>,
    // Serialises writes so the file always ends up with the latest snapshot.
    persist: Mutex<()>,
}

impl HistoryController {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            records: RwLock::new(Vec::new()),
            persist: Mutex::new(()),
        }
    }

    /// Replaces the in-memory history with the stored one. Returns the number of entries.
    pub async fn load(&self) -> usize {
        match self.storage.load_history().await {
            Ok(records) => {
                let count = records.len();
                *self.records.write() = records;
                count
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load call history");
                0
            }
        }
    }

    /// Adds `record` in front without persisting it.
    ///
    /// Usable from synchronous contexts; call [`HistoryController::persist`] afterwards.
    pub fn push(&self, record: CallRecord) {
        let mut records = self.records.write();
        records.retain(|existing| existing.id != record.id);
        records.insert(0, record);
        records.truncate(MAX_HISTORY);
    }

    pub async fn record(&self, record: CallRecord) {
        self.push(record);
        self.persist().await;
    }

    /// Writes the current history to storage.
    pub async fn persist(&self) {
        let _persist = self.persist.lock().await;
        let snapshot = self.records.read().clone();

        if let Err(err) = self.storage.save_history(&snapshot).await {
            tracing::warn!(error = %err, "Failed to persist call history");
        }
    }

    /// Matching entries, newest first.
    pub fn list(&self, filter: &HistoryFilter) -> Vec<CallRecord> {
        self.records
            .read()
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<CallRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        };

        if removed {
            self.persist().await;
        }
        removed
    }

    pub async fn clear(&self) {
        self.records.write().clear();
        self.persist().await;
    }

    /// Loads entry `id` into the request state without sending it.
    ///
    /// Sets the endpoint, the selected service and method, the request body and its
    /// metadata. Returns the entry, or `None` if it does not exist.
    pub fn replay(&self, id: Uuid, state: &AppState) -> Option<CallRecord> {
        let record = self.get(id)?;

        let (service, method) = match record.method.split_once('/') {
            Some((service, method)) => (Some(service.to_string()), Some(method.to_string())),
            None => (None, None),
        };

        if record.endpoint.is_some() {
            state.endpoint.set(record.endpoint.clone());
        }
        state.selected_service.set(service);
        state.selected_method.set(method);
        state.request.update(|request| {
            request.body = record.request.clone();
            request.metadata = record.request_metadata.clone();
        });

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(method: &str, request: &str) -> CallRecord {
        CallRecord::new(None, method, request).succeeded(
            "{}".into(),
            Vec::new(),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn filter_matches_method_body_and_error() {
        let ok = record("helloworld.Greeter/SayHello", r#"{"name": "Ada"}"#);
        let failed = CallRecord::new(None, "playground.Playground/Fail", "{}")
            .failed("PERMISSION_DENIED: nope".into(), Duration::from_millis(1));

        assert!(HistoryFilter::query("sayhello").matches(&ok));
        assert!(HistoryFilter::query("ADA").matches(&ok));
        assert!(!HistoryFilter::query("ada").matches(&failed));
        assert!(HistoryFilter::query("permission").matches(&failed));
        assert!(HistoryFilter::default().matches(&failed));

        let errors = HistoryFilter::default().with_status(CallStatus::Error);
        assert!(errors.matches(&failed));
        assert!(!errors.matches(&ok));
    }

    #[tokio::test]
    async fn push_keeps_newest_first_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryController::new(Storage::new(dir.path()));

        for i in 0..(MAX_HISTORY + 5) {
            history.push(record("svc.S/M", &format!("{{\"i\": {i}}}")));
        }

        let all = history.list(&HistoryFilter::default());
        assert_eq!(all.len(), MAX_HISTORY);
        assert_eq!(all[0].request, format!("{{\"i\": {}}}", MAX_HISTORY + 4));
    }
}
