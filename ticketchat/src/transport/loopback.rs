//! In-process hub for testing.
//!
//! [`LoopbackHub`] plays the server side: it records every invocation a
//! client makes and can push events back to the connected client. Events are
//! delivered from a single dispatcher task per connection, preserving the
//! one-at-a-time delivery guarantee of a real hub connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{ConnectionError, HandlerRegistry, HubConnector, HubTransport};

enum Inbound {
    Event(String, Vec<Value>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct HubState {
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    failing: Mutex<HashMap<String, String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    live: Mutex<Option<Arc<AtomicBool>>>,
    client: Mutex<Option<HandlerRegistry>>,
    connect_delay: Mutex<Option<Duration>>,
    refuse: AtomicBool,
    connections: AtomicUsize,
    stops: AtomicUsize,
}

/// Server side of an in-process hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<HubState>,
}

impl LoopbackHub {
    /// Create a hub that accepts connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that dials this hub.
    #[must_use]
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { hub: self.clone() }
    }

    /// When `true`, subsequent connects fail with
    /// [`ConnectionError::Unreachable`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make every subsequent connect take `delay` before it completes.
    pub fn delay_connections(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    /// Make invocations of `target` fail with `reason`.
    pub fn fail_invocations_of(&self, target: &str, reason: &str) {
        self.state
            .failing
            .lock()
            .insert(target.to_string(), reason.to_string());
    }

    /// Push an event to the connected client. Dropped when nobody is connected.
    pub fn emit(&self, target: &str, arguments: Vec<Value>) {
        let sender = self.state.inbound.lock().clone();
        match sender {
            Some(tx) => {
                let _ = tx.send(Inbound::Event(target.to_string(), arguments));
            }
            None => tracing::debug!(target, "loopback hub has no client, event dropped"),
        }
    }

    /// Wait until every event emitted so far has been handed to the client.
    pub async fn flush(&self) {
        let sender = self.state.inbound.lock().clone();
        if let Some(tx) = sender {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Inbound::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Simulate the server dropping the connection. The client's close
    /// handler runs if the connection was still up.
    pub fn drop_connection(&self) {
        let was_live = self
            .state
            .live
            .lock()
            .take()
            .is_some_and(|live| live.swap(false, Ordering::SeqCst));
        self.state.inbound.lock().take();
        let client = self.state.client.lock().take();
        if was_live && let Some(handlers) = client {
            handlers.notify_closed();
        }
    }

    /// Whether a client is currently connected.
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.state
            .live
            .lock()
            .as_ref()
            .is_some_and(|live| live.load(Ordering::SeqCst))
    }

    /// Every invocation received, in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.state.invocations.lock().clone()
    }

    /// Arguments of every invocation of `target`, in order.
    #[must_use]
    pub fn invocations_of(&self, target: &str) -> Vec<Vec<Value>> {
        self.state
            .invocations
            .lock()
            .iter()
            .filter(|(name, _)| name == target)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Number of accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of client-initiated stops.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

/// Client-side factory for [`LoopbackTransport`] connections.
#[derive(Clone)]
pub struct LoopbackConnector {
    hub: LoopbackHub,
}

impl HubConnector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, handlers: HandlerRegistry) -> Result<LoopbackTransport, ConnectionError> {
        let state = &self.hub.state;
        let delay = *state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if state.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable("loopback".to_string()));
        }

        let live = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher_live = Arc::clone(&live);
        *state.client.lock() = Some(handlers.clone());
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Event(target, arguments) => {
                        if dispatcher_live.load(Ordering::SeqCst) {
                            handlers.dispatch(&target, &arguments);
                        }
                    }
                    Inbound::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        *state.inbound.lock() = Some(tx);
        *state.live.lock() = Some(Arc::clone(&live));
        state.connections.fetch_add(1, Ordering::SeqCst);

        Ok(LoopbackTransport {
            hub: self.hub.clone(),
            live,
        })
    }
}

/// Client end of a loopback connection.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    live: Arc<AtomicBool>,
}

impl HubTransport for LoopbackTransport {
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        let state = &self.hub.state;
        state
            .invocations
            .lock()
            .push((target.to_string(), arguments));
        if let Some(reason) = state.failing.lock().get(target) {
            return Err(ConnectionError::Invoke {
                target: target.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.hub.state.stops.fetch_add(1, Ordering::SeqCst);
            self.hub.state.inbound.lock().take();
        }
    }
}
