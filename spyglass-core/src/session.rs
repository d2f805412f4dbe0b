//! # Session
//!
//! The composition root for front-ends. A [`Session`] owns one [`ConnectionManager`], the
//! observable [`AppState`], the history and workspace controllers, and, while connected,
//! the [`SchemaCache`] and [`Invoker`] of the live connection.
//!
//! The schema cache lives for exactly one connected lifetime: as soon as the manager leaves
//! `Connected` the cache and the invoker are dropped and the state forgets the services.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use spyglass_core::{Endpoint, Session, Settings};
//! use tokio_util::sync::CancellationToken;
//!
//! let session = Session::open(Settings::from_env()?).await;
//! let cancel = CancellationToken::new();
//!
//! session.connect(Endpoint::plaintext("localhost:50051")?, &cancel).await?;
//! session.select_service("helloworld.Greeter").await?;
//! session.select_method("SayHello").await?;
//! session.state().set_request_body(r#"{"name": "Ada"}"#);
//!
//! let outcome = session.send(&cancel).await?;
//! # Ok(())
//! # }
//! ```
use crate::config::Settings;
use crate::connection::{Connection, ConnectionManager, Endpoint, SubscriptionId};
use crate::error::Error;
use crate::history::{HistoryController, record_from_summary};
use crate::invoker::{
    BidiStream, BufferStats, CallOptions, CallSummary, ClientStream, Invoker, ServerStream,
    UnaryResponse,
};
use crate::schema::{CallShape, Descriptor, MethodSchema, SchemaCache, ServiceInfo};
use crate::state::AppState;
use crate::storage::{CallRecord, Storage, Workspace};
use crate::workspace::WorkspaceController;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What [`Session::send`] started.
///
/// Unary calls have already completed. Streaming calls are running and driven through
/// their handle.
pub enum CallOutcome {
    Unary(UnaryResponse),
    ServerStream(ServerStream),
    ClientStream(ClientStream),
    Bidi(BidiStream),
}

/// Everything tied to one connected lifetime.
#[derive(Clone)]
struct Live {
    generation: u64,
    schema: Arc<SchemaCache>,
    invoker: Invoker,
}

pub struct Session {
    settings: Settings,
    manager: Arc<ConnectionManager>,
    state: Arc<AppState>,
    history: Arc<HistoryController>,
    workspaces: WorkspaceController,
    live: Arc<RwLock<Option<Live>>>,
    subscription: SubscriptionId,
}

impl Session {
    /// Creates a session and loads the stored history.
    pub async fn open(settings: Settings) -> Self {
        let storage = Storage::from_settings(&settings);
        let history = Arc::new(HistoryController::new(storage.clone()));
        let loaded = history.load().await;

        let manager = Arc::new(ConnectionManager::new(
            settings.keep_alive.clone(),
            settings.dial_timeout,
        ));
        let state = Arc::new(AppState::new());
        let live: Arc<RwLock<Option<Live>>> = Arc::new(RwLock::new(None));

        let subscription = {
            let state = state.clone();
            let live = live.clone();
            manager.subscribe(move |connection, message| {
                state.status.set(message.to_string());
                state.connected.replace(connection.is_connected());
                if let Some(endpoint) = connection.endpoint() {
                    state.endpoint.set(Some(endpoint.clone()));
                }
                if !connection.is_connected() {
                    live.write().take();
                    state.clear_connection();
                }
            })
        };

        tracing::debug!(
            data_dir = %settings.data_dir.display(),
            history = loaded,
            "Session opened"
        );

        Self {
            settings,
            manager,
            state,
            history,
            workspaces: WorkspaceController::new(storage),
            live,
            subscription,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn history(&self) -> &HistoryController {
        &self.history
    }

    pub fn workspaces(&self) -> &WorkspaceController {
        &self.workspaces
    }

    /// The schema cache of the live connection.
    pub fn schema(&self) -> Result<Arc<SchemaCache>, Error> {
        Ok(self.live()?.schema)
    }

    /// The invoker of the live connection.
    pub fn invoker(&self) -> Result<Invoker, Error> {
        Ok(self.live()?.invoker)
    }

    /// Connects to `endpoint`, remembers it in the recents and loads its services.
    pub async fn connect(
        &self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServiceInfo>, Error> {
        let connection = self.manager.connect(endpoint.clone(), cancel).await?;
        self.install(&connection);

        self.workspaces.remember(&endpoint).await;
        self.refresh_services().await
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    /// Lists and resolves every service of the live connection and publishes them.
    pub async fn refresh_services(&self) -> Result<Vec<ServiceInfo>, Error> {
        let services = self.schema()?.load_services().await?;
        self.state.services.set(services.clone());
        Ok(services)
    }

    /// Selects service `name` (fully qualified) and clears the method selection.
    pub async fn select_service(&self, name: &str) -> Result<ServiceInfo, Error> {
        let service = self.schema()?.resolve_service(name).await?;
        if let Some(reason) = &service.resolution_error {
            return Err(Error::InvalidDescriptor(reason.clone()));
        }

        self.state.selected_service.set(Some(service.full_name.clone()));
        self.state.selected_method.set(None);
        Ok(service)
    }

    /// Selects `method` of the selected service.
    ///
    /// A blank request body is pre-filled with a template of the input message.
    pub async fn select_method(&self, method: &str) -> Result<MethodSchema, Error> {
        let service = self
            .state
            .selected_service
            .get()
            .ok_or_else(|| Error::Validation("No service selected".into()))?;

        let schema = self.schema()?;
        let resolved = schema.resolve_method(&service, method).await?;
        self.state.selected_method.set(Some(method.to_string()));

        if self.state.request.get().body.trim().is_empty() {
            let template = schema.message_template(&resolved.info.input).await?;
            self.state.set_request_body(crate::codec::render(&template));
        }

        Ok(resolved)
    }

    pub async fn describe(&self, symbol: &str) -> Result<Descriptor, Error> {
        Ok(self.schema()?.describe_symbol(symbol).await?)
    }

    /// Sends the current request to the selected method.
    ///
    /// Unary calls complete before this returns and their response is published to the
    /// state. Streaming calls return their handle: server-streaming calls are already
    /// running, while client and bidirectional calls wait for messages on the handle
    /// (see [`crate::codec::split_messages`]).
    pub async fn send(&self, cancel: &CancellationToken) -> Result<CallOutcome, Error> {
        let options = CallOptions {
            deadline: None,
            codec: self.settings.codec.clone(),
        };
        self.send_with(&options, cancel).await
    }

    /// [`Session::send`] with explicit call options.
    pub async fn send_with(
        &self,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, Error> {
        let (service, method) = match (
            self.state.selected_service.get(),
            self.state.selected_method.get(),
        ) {
            (Some(service), Some(method)) => (service, method),
            _ => return Err(Error::Validation("No method selected".into())),
        };

        let live = self.live()?;
        let schema = live.schema.resolve_method(&service, &method).await?;
        let request = self.state.request.get();
        let descriptor = &schema.descriptor;

        self.state.begin_call();
        let outcome = match schema.info.shape() {
            CallShape::Unary => live
                .invoker
                .unary(descriptor, &request.body, &request.metadata, options, cancel)
                .await
                .map(CallOutcome::Unary),
            CallShape::ServerStreaming => live
                .invoker
                .server_streaming(descriptor, &request.body, &request.metadata, options, cancel)
                .map(CallOutcome::ServerStream),
            CallShape::ClientStreaming => live
                .invoker
                .client_streaming(descriptor, &request.metadata, options, cancel)
                .map(CallOutcome::ClientStream),
            CallShape::Bidirectional => live
                .invoker
                .bidirectional(descriptor, &request.metadata, options, cancel)
                .map(CallOutcome::Bidi),
        };

        match &outcome {
            Ok(CallOutcome::Unary(response)) => self.state.finish_call(response),
            Ok(CallOutcome::ServerStream(stream)) => self.track_progress(stream.progress()),
            Ok(CallOutcome::Bidi(stream)) => self.track_progress(stream.progress()),
            Ok(CallOutcome::ClientStream(_)) => {}
            Err(err) => self.state.fail_call(err, None),
        }

        outcome
    }

    /// Loads history entry `id` into the request state. Nothing is sent.
    pub fn replay(&self, id: Uuid) -> Option<CallRecord> {
        self.history.replay(id, &self.state)
    }

    pub async fn save_workspace(&self, name: &str, overwrite: bool) -> Result<Workspace, Error> {
        Ok(self.workspaces.save(name, &self.state, overwrite).await?)
    }

    /// Restores workspace `name`. The caller decides whether to connect to its endpoint.
    pub async fn load_workspace(&self, name: &str) -> Result<Workspace, Error> {
        Ok(self.workspaces.load(name, &self.state).await?)
    }

    pub async fn list_workspaces(&self) -> Result<Vec<String>, Error> {
        Ok(self.workspaces.list().await?)
    }

    pub async fn delete_workspace(&self, name: &str) -> Result<(), Error> {
        Ok(self.workspaces.delete(name).await?)
    }

    pub async fn recents(&self) -> Vec<Endpoint> {
        self.workspaces.recents().await
    }

    fn live(&self) -> Result<Live, Error> {
        self.live.read().clone().ok_or(Error::NotConnected)
    }

    /// Builds the schema cache and invoker for `connection` unless they already exist.
    fn install(&self, connection: &Connection) {
        let generation = connection.generation();
        if self
            .live
            .read()
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            return;
        }

        let manager: Weak<ConnectionManager> = Arc::downgrade(&self.manager);
        let fault = Arc::new(move |err: &Error| {
            if let Some(manager) = manager.upgrade() {
                manager.report_fault(generation, err);
            }
        });

        let history = self.history.clone();
        let state = self.state.clone();
        let endpoint = connection.endpoint().clone();
        // The record is pushed before the response is published, so a subscriber that sees
        // a finished stream also sees its history entry.
        let complete = Arc::new(move |summary: CallSummary| {
            let finished = (summary.shape != CallShape::Unary).then(|| {
                (
                    summary.response.clone().unwrap_or_default(),
                    summary.duration,
                    summary.error.clone(),
                )
            });

            history.push(record_from_summary(Some(endpoint.clone()), summary));
            if let Some((body, duration, error)) = finished {
                state.finish_stream(body, duration, error.as_ref());
            }

            let history = history.clone();
            tokio::spawn(async move { history.persist().await });
        });

        let live = Live {
            generation,
            schema: Arc::new(SchemaCache::new(connection.channel())),
            invoker: Invoker::for_connection(connection)
                .with_limits(self.settings.buffer)
                .with_fault_sink(fault)
                .with_completion(complete),
        };

        // The connection may already have been replaced or lost. The write lock is held
        // across the check so the observer clearing `live` cannot run in between.
        let mut slot = self.live.write();
        if self.manager.current().map(|c| c.generation()) == Some(generation) {
            *slot = Some(live);
        }
    }

    fn track_progress(&self, mut progress: watch::Receiver<BufferStats>) {
        let state = self.state.clone();
        state.stream_progress.set(Some(Default::default()));

        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let stats = *progress.borrow_and_update();
                state.stream_progress.set(Some(stats));
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.subscription);
    }
}
