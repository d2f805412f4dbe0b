//! # Connection Manager
//!
//! Owns at most one live gRPC channel and publishes every state transition, in order, to
//! its observers.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --disconnect--> Disconnected
//!                               |                  |
//!                               +--fail--> Error <-+--fatal fault
//!                                            |
//!                                            +--connect--> Connecting
//! ```
//!
//! Each established channel gets a new generation number and a cancellation scope. Call
//! handles derive their tokens from that scope, so replacing or dropping the connection
//! cancels every call still running on it.
use crate::error::Error;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

mod endpoint;
mod tls;

pub use endpoint::{Endpoint, SecurityProfile};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("The endpoint address cannot be empty")]
    EmptyAddress,

    #[error("Invalid endpoint address '{0}': {1}")]
    InvalidAddress(String, String),

    #[error("The scheme of '{0}' does not match the selected {1} security profile")]
    SchemeMismatch(String, &'static str),

    #[error("Certificate verification can only be disabled for TLS endpoints")]
    InsecureWithoutTls,

    #[error("Failed to configure TLS: '{0}'")]
    Tls(String),

    #[error("Failed to connect to '{0}': '{1}'")]
    ConnectionFailed(String, #[source] tonic::transport::Error),

    #[error("Timed out connecting to '{0}' after {1:?}")]
    DeadlineExceeded(String, Duration),

    #[error("Connecting to '{0}' was cancelled")]
    Cancelled(String),
}

/// HTTP/2 keepalive settings applied to every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Interval between keepalive pings.
    pub interval: Duration,
    /// How long to wait for a ping acknowledgement before declaring the connection dead.
    pub timeout: Duration,
    /// Whether to ping even when no call is active.
    pub while_idle: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            while_idle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(Endpoint),
    Connected(Endpoint),
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            ConnectionState::Connecting(endpoint) | ConnectionState::Connected(endpoint) => {
                Some(endpoint)
            }
            _ => None,
        }
    }
}

/// A lease on the live channel.
#[derive(Debug, Clone)]
pub struct Connection {
    channel: Channel,
    endpoint: Endpoint,
    generation: u64,
    scope: CancellationToken,
}

impl Connection {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled when this connection is replaced, closed or declared dead.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    fn close(self) {
        self.scope.cancel();
        let Connection {
            channel, endpoint, ..
        } = self;

        // The channel may still be flushing; release it off the caller's path.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    drop(channel);
                    tracing::debug!(endpoint = %endpoint, "Closed channel");
                });
            }
            Err(_) => drop(channel),
        }
    }
}

pub type SubscriptionId = u64;

type Observer = Arc<dyn Fn(&ConnectionState, &str) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    active: Option<Connection>,
    generation: u64,
}

/// Transitions waiting to be handed to the observers.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<(ConnectionState, String)>,
    delivering: bool,
}

pub struct ConnectionManager {
    keep_alive: KeepAliveConfig,
    dial_timeout: Duration,
    inner: RwLock<Inner>,
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_subscription: AtomicU64,
    // Serialises connect and disconnect.
    operation: AsyncMutex<()>,
    outbox: Mutex<Outbox>,
    watch: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(keep_alive: KeepAliveConfig, dial_timeout: Duration) -> Self {
        let (watch, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            keep_alive,
            dial_timeout,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                active: None,
                generation: 0,
            }),
            observers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            operation: AsyncMutex::new(()),
            outbox: Mutex::new(Outbox::default()),
            watch,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state.clone()
    }

    /// The live connection, `None` unless the state is `Connected`.
    pub fn current(&self) -> Option<Connection> {
        let inner = self.inner.read();
        match inner.state {
            ConnectionState::Connected(_) => inner.active.clone(),
            _ => None,
        }
    }

    /// Registers an observer called with `(state, message)` for every later transition.
    ///
    /// Observers run with no internal lock held, one notification at a time and in
    /// transition order. The task performing a transition delivers it before returning,
    /// unless another task is already delivering, in which case that task delivers it.
    pub fn subscribe(
        &self,
        observer: impl Fn(&ConnectionState, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// A receiver always holding the latest state, for async consumers.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.watch.subscribe()
    }

    /// Connects to `endpoint`, replacing any existing connection.
    ///
    /// Connecting to the endpoint that is already connected returns the live connection
    /// without dialing again. The previous channel is closed in the background so the new
    /// dial is not delayed by it.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Where to connect. Its own deadline, if any, overrides the default dial timeout.
    /// * `cancel` - Aborts the dial. The manager returns to `Disconnected`.
    pub async fn connect(
        &self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectError> {
        let _operation = self.operation.lock().await;

        if let Some(current) = self.current()
            && current.endpoint == endpoint
        {
            return Ok(current);
        }

        let mut previous = None;
        let mut generation = 0;
        self.transition(|inner| {
            inner.generation += 1;
            generation = inner.generation;
            previous = inner.active.take();
            Some((
                ConnectionState::Connecting(endpoint.clone()),
                format!("Connecting to {endpoint}"),
            ))
        });

        if let Some(previous) = previous {
            previous.close();
        }

        let timeout = endpoint.deadline().unwrap_or(self.dial_timeout);
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled(endpoint.uri())),
            result = tokio::time::timeout(timeout, dial(&endpoint, &self.keep_alive, timeout)) => {
                result.unwrap_or_else(|_| Err(ConnectError::DeadlineExceeded(endpoint.uri(), timeout)))
            }
        };

        match dialed {
            Ok(channel) => {
                let connection = Connection {
                    channel,
                    endpoint: endpoint.clone(),
                    generation,
                    scope: CancellationToken::new(),
                };
                let lease = connection.clone();

                self.transition(|inner| {
                    inner.active = Some(connection);
                    Some((
                        ConnectionState::Connected(endpoint.clone()),
                        format!("Connected to {endpoint}"),
                    ))
                });

                Ok(lease)
            }
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "Dial failed");

                let state = match err {
                    ConnectError::Cancelled(_) => ConnectionState::Disconnected,
                    _ => ConnectionState::Error(err.to_string()),
                };
                self.transition(|_| Some((state, err.to_string())));

                Err(err)
            }
        }
    }

    /// Closes the live connection, if any, and cancels every call running on it.
    pub async fn disconnect(&self) {
        let _operation = self.operation.lock().await;

        let mut previous = None;
        self.transition(|inner| {
            inner.generation += 1;
            previous = inner.active.take();
            match inner.state {
                ConnectionState::Disconnected => None,
                _ => Some((ConnectionState::Disconnected, "Disconnected".to_string())),
            }
        });

        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Reports a failure observed by a call made on connection `generation`.
    ///
    /// Fatal transport failures move a `Connected` manager to `Error` and cancel every call
    /// on the connection. Everything else, and faults reported for a connection that has
    /// already been replaced, is ignored. Returns whether a transition happened.
    pub fn report_fault(&self, generation: u64, error: &Error) -> bool {
        if !error.is_connection_fatal() {
            return false;
        }

        let mut previous = None;
        let changed = self.transition(|inner| {
            if inner.generation != generation || !inner.state.is_connected() {
                return None;
            }
            previous = inner.active.take();
            Some((
                ConnectionState::Error(error.to_string()),
                format!("Connection lost: {error}"),
            ))
        });

        if let Some(previous) = previous {
            tracing::warn!(endpoint = %previous.endpoint, error = %error, "Connection declared dead");
            previous.close();
        }

        changed
    }

    fn transition(
        &self,
        apply: impl FnOnce(&mut Inner) -> Option<(ConnectionState, String)>,
    ) -> bool {
        {
            let mut inner = self.inner.write();
            let Some((state, message)) = apply(&mut inner) else {
                return false;
            };
            inner.state = state.clone();
            self.watch.send_replace(state.clone());
            // Queued under the state lock so the queue follows transition order.
            self.outbox.lock().queue.push_back((state, message));
        }

        self.deliver();
        true
    }

    fn deliver(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.delivering {
                return;
            }
            outbox.delivering = true;
        }

        loop {
            let (state, message) = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        outbox.delivering = false;
                        return;
                    }
                }
            };

            let observers: Vec<Observer> = self
                .observers
                .read()
                .iter()
                .map(|(_, observer)| observer.clone())
                .collect();

            for observer in observers {
                observer(&state, &message);
            }
        }
    }
}

async fn dial(
    endpoint: &Endpoint,
    keep_alive: &KeepAliveConfig,
    timeout: Duration,
) -> Result<Channel, ConnectError> {
    let transport = tonic::transport::Endpoint::from_shared(endpoint.uri())
        .map_err(|e| ConnectError::InvalidAddress(endpoint.address().to_string(), e.to_string()))?
        .connect_timeout(timeout)
        .http2_keep_alive_interval(keep_alive.interval)
        .keep_alive_timeout(keep_alive.timeout)
        .keep_alive_while_idle(keep_alive.while_idle);

    let channel = if endpoint.security().uses_tls() {
        let connector = tls::https_connector(endpoint.security())?;
        transport.connect_with_connector(connector).await
    } else {
        transport.connect().await
    }
    .map_err(|e| ConnectError::ConnectionFailed(endpoint.uri(), e))?;

    tracing::debug!(
        endpoint = %endpoint,
        keep_alive_interval = ?keep_alive.interval,
        "gRPC channel connected"
    );

    Ok(channel)
}
