//! Push-channel transport for `TicketChat`.
//!
//! The live channel is a hub connection: both sides call named methods on
//! each other with positional JSON arguments. This module defines the
//! [`HubTransport`] / [`HubConnector`] traits that concrete transports
//! implement, and the [`ConnectionManager`] that owns one session's
//! connection lifecycle on top of them.
//!
//! Implementations:
//! - [`hub::WsConnector`]: SignalR JSON hub protocol over WebSocket
//! - [`loopback::LoopbackHub`]: in-process hub for tests

pub mod hub;
pub mod loopback;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use ticketchat_proto::api::methods;
use ticketchat_proto::hub::CodecError;

/// Observable state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, or the connection was lost.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and joined to the ticket.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Errors raised while establishing or using the push channel.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// An invoke was attempted while not connected. Nothing was queued.
    #[error("not connected")]
    NotConnected,

    /// A connect was attempted while a connection is already active or pending.
    #[error("connection already {0}")]
    AlreadyActive(ConnectionState),

    /// The connection closed underneath an operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation did not complete in time.
    #[error("transport operation timed out")]
    Timeout,

    /// The hub endpoint could not be reached.
    #[error("hub {0} is unreachable")]
    Unreachable(String),

    /// The hub rejected the protocol handshake.
    #[error("hub handshake failed: {0}")]
    Handshake(String),

    /// The hub reported an error for an invocation.
    #[error("invocation of {target} failed: {reason}")]
    Invoke {
        /// Method that was invoked.
        target: String,
        /// Error text reported by the hub.
        reason: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("hub codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connect was overtaken by a disconnect or shutdown and its
    /// connection, if any, was stopped.
    #[error("connect abandoned")]
    Abandoned,
}

/// Callback invoked with the positional arguments of an inbound event.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Callback invoked once when a connection ends on its own.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Named event handlers shared between a connection manager and the
/// transport's inbound dispatcher.
///
/// At most one handler exists per event name: registering a name again
/// replaces the previous handler. A separate close handler hears about
/// connections the transport saw end.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, EventHandler>>>,
    on_closed: Arc<RwLock<Option<CloseHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, replacing any previous registration.
    pub fn on(&self, event: &str, handler: EventHandler) {
        let mut handlers = self.handlers.write();
        if handlers.insert(event.to_string(), handler).is_some() {
            tracing::debug!(event, "replaced existing event handler");
        }
    }

    /// Remove the handler for `event`, if any.
    pub fn remove(&self, event: &str) {
        self.handlers.write().remove(event);
    }

    /// Deliver an inbound event. Returns `false` when nobody listens for it.
    ///
    /// The handler is cloned out before it runs so it may itself touch the
    /// registry.
    pub fn dispatch(&self, event: &str, arguments: &[Value]) -> bool {
        let handler = self.handlers.read().get(event).cloned();
        match handler {
            Some(handler) => {
                handler(arguments);
                true
            }
            None => {
                tracing::debug!(event, "no handler registered, dropping event");
                false
            }
        }
    }

    /// Register the close handler, replacing any previous one.
    pub fn on_closed(&self, handler: CloseHandler) {
        *self.on_closed.write() = Some(handler);
    }

    /// Called by transports when the connection ended underneath them.
    pub fn notify_closed(&self) {
        let handler = self.on_closed.read().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Number of registered event names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("HandlerRegistry")
            .field("events", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An established hub connection.
///
/// Inbound events are delivered by the transport to the [`HandlerRegistry`]
/// it was connected with, one at a time, from a single task.
pub trait HubTransport: Send + Sync + 'static {
    /// Invoke a hub method and wait for the hub to acknowledge it.
    fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> impl std::future::Future<Output = Result<(), ConnectionError>> + Send;

    /// Whether the underlying connection is still open.
    fn is_connected(&self) -> bool;

    /// Close the connection. Pending invocations fail with
    /// [`ConnectionError::ConnectionClosed`].
    fn stop(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Factory for [`HubTransport`] connections.
pub trait HubConnector: Send + Sync + 'static {
    /// The transport produced by a successful connect.
    type Transport: HubTransport;

    /// Open a new connection delivering inbound events to `handlers`.
    fn connect(
        &self,
        handlers: HandlerRegistry,
    ) -> impl std::future::Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}

/// Owns the push-channel lifecycle for one chat session.
///
/// The manager is scoped to a session and passed by reference (usually as
/// an `Arc`) to whatever needs to invoke hub methods. Handlers may be
/// subscribed before [`connect`](Self::connect); they stay registered across
/// reconnects.
///
/// A [`disconnect`](Self::disconnect) issued while a connect is in flight
/// abandons that connect: it never joins, and whatever connection it opened
/// is stopped instead of stored.
pub struct ConnectionManager<C: HubConnector> {
    connector: C,
    handlers: HandlerRegistry,
    state: Mutex<ConnectionState>,
    transport: RwLock<Option<Arc<C::Transport>>>,
    /// Bumped by every disconnect. A connect only completes in the epoch it
    /// started in.
    epoch: AtomicU64,
    shut_down: AtomicBool,
}

impl<C: HubConnector> ConnectionManager<C> {
    /// Creates a disconnected manager.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            handlers: HandlerRegistry::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            transport: RwLock::new(None),
            epoch: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a handler for an inbound event, replacing any previous one.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.on(event, Arc::new(handler));
    }

    /// Remove the handler for an inbound event.
    pub fn unsubscribe(&self, event: &str) {
        self.handlers.remove(event);
    }

    /// Register a callback for a connection that drops on its own.
    ///
    /// Not called for connections stopped through this manager.
    pub fn on_connection_lost<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.on_closed(Arc::new(handler));
    }

    /// Current connection state.
    ///
    /// A connection that dropped on its own reports `Disconnected` even
    /// before anyone calls [`disconnect`](Self::disconnect).
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.lock();
        if state == ConnectionState::Connected
            && !self
                .transport
                .read()
                .as_ref()
                .is_some_and(|transport| transport.is_connected())
        {
            return ConnectionState::Disconnected;
        }
        state
    }

    /// Connect and join the ticket's group.
    ///
    /// A failure is terminal for this attempt; the caller decides whether
    /// to try again.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::AlreadyActive`] if connected or connecting.
    /// - [`ConnectionError::Abandoned`] if the manager was shut down, or a
    ///   disconnect arrived before the join completed.
    /// - Any connector error, or the join invocation's error.
    pub async fn connect(&self, ticket_id: i64) -> Result<(), ConnectionError> {
        let epoch = {
            let current = self.state();
            let mut state = self.state.lock();
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(ConnectionError::Abandoned);
            }
            if current != ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyActive(current));
            }
            *state = ConnectionState::Connecting;
            self.epoch.load(Ordering::SeqCst)
        };
        tracing::info!(ticket_id, "connecting to hub");

        let transport = match self.connector.connect(self.handlers.clone()).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::warn!(ticket_id, error = %e, "hub connect failed");
                self.fail_attempt(epoch);
                return Err(e);
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::info!(ticket_id, "disconnected while connecting, not joining");
            transport.stop().await;
            return Err(ConnectionError::Abandoned);
        }

        if let Err(e) = transport
            .invoke(methods::JOIN_TICKET, vec![Value::from(ticket_id)])
            .await
        {
            tracing::warn!(ticket_id, error = %e, "joining ticket group failed");
            transport.stop().await;
            self.fail_attempt(epoch);
            return Err(e);
        }

        let stored = {
            let mut state = self.state.lock();
            let current = self.epoch.load(Ordering::SeqCst) == epoch;
            if current {
                *self.transport.write() = Some(Arc::clone(&transport));
                *state = ConnectionState::Connected;
            }
            current
        };
        if !stored {
            tracing::info!(ticket_id, "disconnected while joining, dropping connection");
            transport.stop().await;
            return Err(ConnectionError::Abandoned);
        }
        tracing::info!(ticket_id, "joined ticket group");
        Ok(())
    }

    /// Invoke a hub method. Fails fast when not connected.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when the channel is not in
    /// the `Connected` state, or the transport's error otherwise.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        let transport = self.live_transport().ok_or(ConnectionError::NotConnected)?;
        transport.invoke(target, arguments).await
    }

    /// Tear down the connection.
    ///
    /// Only a live transport is stopped. Called while a connect is in flight,
    /// it abandons that connect.
    pub async fn disconnect(&self) {
        let transport = {
            let mut state = self.state.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            if *state == ConnectionState::Connecting {
                tracing::info!("connect in flight abandoned");
            }
            *state = ConnectionState::Disconnected;
            self.transport.write().take()
        };
        match transport {
            Some(transport) if transport.is_connected() => {
                tracing::info!("disconnecting from hub");
                transport.stop().await;
            }
            _ => tracing::debug!("disconnect skipped, channel not connected"),
        }
    }

    /// Disconnect for good. Any later or still pending connect is abandoned.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Returns the handler registry (for inspection in tests and tooling).
    pub const fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Reset a failed attempt unless a disconnect already moved on.
    fn fail_attempt(&self, epoch: u64) {
        let mut state = self.state.lock();
        if self.epoch.load(Ordering::SeqCst) == epoch {
            *state = ConnectionState::Disconnected;
        }
    }

    fn live_transport(&self) -> Option<Arc<C::Transport>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.transport.read().clone()
    }
}
