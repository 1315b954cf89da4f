// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end chat over a real hub.
//!
//! The customer session talks to an in-process hub server over WebSocket.
//! The technician side is driven either through the hub state directly or
//! through a second client connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ticketchat::backend::Backend;
use ticketchat::chat::attachment::HttpAttachments;
use ticketchat::chat::history::HttpHistory;
use ticketchat::chat::params::{SessionParams, ViewMode};
use ticketchat::chat::{
    ChatSession, Notice, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionReport,
};
use ticketchat::transport::hub::{HubOptions, WsConnector};
use ticketchat::transport::{ConnectionManager, ConnectionState};
use ticketchat_hub::hub::{self as server, HubState};
use ticketchat_proto::api::{methods, roles};
use ticketchat_proto::message::{MessageBody, Origin};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_hub() -> (SocketAddr, Arc<HubState>) {
    let state = Arc::new(HubState::new());
    let (addr, _server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

fn connector(addr: SocketAddr) -> WsConnector {
    WsConnector::new(&format!("http://{addr}{}", server::HUB_PATH), HubOptions::default()).unwrap()
}

fn open(
    addr: SocketAddr,
    mode: ViewMode,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    JoinHandle<SessionReport>,
) {
    let params =
        SessionParams::new(Some(42), Some("ana".into()), Some("carlos".into()), mode).unwrap();
    let backend = Backend::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    ChatSession::spawn(
        params,
        SessionConfig::default(),
        connector(addr),
        HttpHistory::new(backend.clone()),
        HttpAttachments::new(backend),
    )
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn connected(events: &mut mpsc::Receiver<SessionEvent>) {
    wait_for(events, |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Connected))
    })
    .await;
}

async fn rendered_text(events: &mut mpsc::Receiver<SessionEvent>, text: &str) -> Origin {
    let SessionEvent::Rendered(message) = wait_for(events, |e| {
        matches!(e, SessionEvent::Rendered(m) if m.body == MessageBody::Text(text.into()))
    })
    .await
    else {
        unreachable!()
    };
    message.origin
}

async fn wait_for_log(state: &HubState, len: usize) {
    for _ in 0..200 {
        if state.store.messages(42).await.len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub log never reached {len} messages");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn technician_message_is_rendered_as_remote() {
    let (addr, state) = start_hub().await;
    let (handle, mut events, task) = open(addr, ViewMode::Interactive);
    connected(&mut events).await;
    assert_eq!(state.group_size(42).await, 1);

    state.post_message(42, "carlos", "bom dia, em que posso ajudar?", roles::TECHNICIAN).await;
    assert_eq!(
        rendered_text(&mut events, "bom dia, em que posso ajudar?").await,
        Origin::Remote
    );

    handle.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn sent_message_is_logged_and_rendered_once() {
    let (addr, state) = start_hub().await;
    let (handle, mut events, task) = open(addr, ViewMode::Interactive);
    connected(&mut events).await;

    handle.send_text("oi").await.unwrap();
    assert_eq!(rendered_text(&mut events, "oi").await, Origin::Local);
    wait_for_log(&state, 1).await;

    let logged = state.store.messages(42).await;
    assert_eq!(logged[0].author, "ana");
    assert_eq!(logged[0].content, "oi");
    assert_eq!(logged[0].role, roles::CLIENT);

    // The hub echoed "oi" back to us; a later marker proves it was processed.
    state.post_message(42, "carlos", "recebido", roles::TECHNICIAN).await;
    rendered_text(&mut events, "recebido").await;

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    let oi = report
        .messages
        .iter()
        .filter(|m| m.body == MessageBody::Text("oi".into()))
        .count();
    assert_eq!(oi, 1);
}

#[tokio::test]
async fn second_client_reaches_the_session() {
    let (addr, state) = start_hub().await;
    let (handle, mut events, task) = open(addr, ViewMode::Interactive);
    connected(&mut events).await;

    let technician = ConnectionManager::new(connector(addr));
    technician.connect(42).await.unwrap();
    assert_eq!(state.group_size(42).await, 2);

    technician
        .invoke(
            methods::SEND_MESSAGE,
            vec![
                Value::from(42),
                Value::from("carlos"),
                Value::from("pode reiniciar o roteador?"),
                Value::from(roles::TECHNICIAN),
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        rendered_text(&mut events, "pode reiniciar o roteador?").await,
        Origin::Remote
    );

    technician.disconnect().await;
    handle.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn read_only_session_receives_but_cannot_send() {
    let (addr, state) = start_hub().await;
    let (handle, mut events, task) = open(addr, ViewMode::ReadOnly);
    connected(&mut events).await;

    assert_eq!(handle.send_text("oi").await, Err(SessionError::ReadOnly));
    state.post_message(42, "carlos", "chamado em análise", roles::TECHNICIAN).await;
    rendered_text(&mut events, "chamado em análise").await;

    handle.close().await.unwrap();
    task.await.unwrap();
    assert_eq!(state.store.messages(42).await.len(), 1);
}

#[tokio::test]
async fn hub_shutdown_is_reported_and_sends_stop() {
    let (addr, state) = start_hub().await;
    let (handle, mut events, task) = open(addr, ViewMode::Interactive);
    connected(&mut events).await;

    state.close_all_connections().await;
    // Reported without any user activity.
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Disconnected))
    })
    .await;

    handle.send_text("alguém aí?").await.unwrap();
    match wait_for(&mut events, |e| !matches!(e, SessionEvent::ConnectionChanged(_))).await {
        SessionEvent::Notice(Notice::NotConnected) => {}
        other => panic!("expected not-connected notice, got {other:?}"),
    }

    handle.close().await.unwrap();
    task.await.unwrap();
    assert!(state.store.messages(42).await.is_empty());
}
