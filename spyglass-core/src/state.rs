//! # Application State
//!
//! The reactive surface front-ends bind to. Every field is an [`Observable`], a thin
//! wrapper over a `tokio::sync::watch` channel: readers get the latest value, subscribers
//! are woken on every change, and publication is thread-safe.
//!
//! Only the text form of the request is published. A front-end that mirrors it into a
//! form representation guards the two directions with [`SyncGuard`].
use crate::Metadata;
use crate::connection::Endpoint;
use crate::error::{Error, ErrorReport};
use crate::invoker::{BufferStats, UnaryResponse};
use crate::schema::ServiceInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// A value with change notification.
#[derive(Debug)]
pub struct Observable<T> {
    sender: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        let (sender, _) = watch::channel(value);
        Self { sender }
    }

    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Publishes `value`, waking subscribers even when it is unchanged.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Applies `apply` in place and publishes the result.
    pub fn update(&self, apply: impl FnOnce(&mut T)) {
        self.sender.send_modify(apply);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T: Clone + PartialEq> Observable<T> {
    /// Publishes `value` only if it differs from the current one. Returns whether it did.
    pub fn replace(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Text,
    Form,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestState {
    pub mode: RequestMode,
    /// The authoritative JSON text of the request.
    pub body: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseState {
    pub body: String,
    pub loading: bool,
    pub error: Option<ErrorReport>,
    /// Human readable, e.g. `"42 ms"`.
    pub duration: String,
    /// Human readable, e.g. `"1.2 KB"`.
    pub size: String,
    pub metadata: Metadata,
}

/// Re-entrancy flag for text <-> form synchronisation.
///
/// ```
/// use spyglass_core::state::SyncGuard;
///
/// let guard = SyncGuard::default();
/// let outer = guard.enter().expect("not syncing yet");
/// assert!(guard.enter().is_none());
/// drop(outer);
/// assert!(guard.enter().is_some());
/// ```
#[derive(Debug, Default)]
pub struct SyncGuard {
    syncing: AtomicBool,
}

impl SyncGuard {
    /// Marks a synchronisation as running, or returns `None` if one already is.
    pub fn enter(&self) -> Option<Syncing<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Syncing { guard: self })
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }
}

/// Clears the [`SyncGuard`] when dropped.
#[derive(Debug)]
pub struct Syncing<'a> {
    guard: &'a SyncGuard,
}

impl Drop for Syncing<'_> {
    fn drop(&mut self) {
        self.guard.syncing.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct AppState {
    pub endpoint: Observable<Option<Endpoint>>,
    pub connected: Observable<bool>,
    /// Last connection status message, e.g. `"Connected to localhost:50051"`.
    pub status: Observable<String>,
    pub services: Observable<Vec<ServiceInfo>>,
    /// Fully-qualified service name.
    pub selected_service: Observable<Option<String>>,
    /// Simple method name.
    pub selected_method: Observable<Option<String>>,
    pub request: Observable<RequestState>,
    pub response: Observable<ResponseState>,
    /// Progress of the running stream, if any.
    pub stream_progress: Observable<Option<BufferStats>>,
    pub sync: SyncGuard,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything learned from the server. The request itself is kept.
    pub fn clear_connection(&self) {
        self.connected.replace(false);
        self.services.set(Vec::new());
        self.selected_service.replace(None);
        self.selected_method.replace(None);
        self.stream_progress.replace(None);
    }

    pub fn set_request_body(&self, body: impl Into<String>) {
        let body = body.into();
        self.request.update(|request| request.body = body);
    }

    pub fn set_request_metadata(&self, metadata: Metadata) {
        self.request.update(|request| request.metadata = metadata);
    }

    pub fn set_mode(&self, mode: RequestMode) {
        self.request.update(|request| request.mode = mode);
    }

    pub fn begin_call(&self) {
        self.response.update(|response| {
            response.loading = true;
            response.error = None;
        });
    }

    pub fn finish_call(&self, response: &UnaryResponse) {
        self.response.set(ResponseState {
            body: response.text().to_string(),
            loading: false,
            error: None,
            duration: format_duration(response.duration),
            size: format_size(response.size),
            metadata: response.metadata.clone(),
        });
    }

    /// Publishes a streamed result: the joined message texts and how long it took.
    pub fn finish_stream(&self, body: String, duration: Duration, error: Option<&Error>) {
        let size = body.len();
        self.response.set(ResponseState {
            body,
            loading: false,
            error: error.map(ErrorReport::from),
            duration: format_duration(duration),
            size: format_size(size),
            metadata: Vec::new(),
        });
    }

    pub fn fail_call(&self, error: &Error, duration: Option<Duration>) {
        self.response.update(|response| {
            response.loading = false;
            response.error = Some(ErrorReport::from(error));
            response.duration = duration.map(format_duration).unwrap_or_default();
        });
    }
}

/// `"850 ms"` below one second, `"1.25 s"` below a minute, `"2m 05s"` above.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{millis} ms")
    } else if millis < 60_000 {
        format!("{:.2} s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

/// Bytes with binary multiples: `"512 B"`, `"1.5 KB"`, `"3.2 MB"`.
pub fn format_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
