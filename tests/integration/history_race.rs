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

//! Integration tests for history reconciliation.
//!
//! History and the live channel start together and race. Whichever side
//! delivers a message first renders it; the other copy is suppressed.
//!
//! Scenario used throughout: ticket 42, local user `ana`, technician
//! `carlos`, who wrote "oi".

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use ticketchat::backend::Backend;
use ticketchat::chat::attachment::{HttpAttachments, InMemoryAttachments};
use ticketchat::chat::history::{HttpHistory, InMemoryHistory};
use ticketchat::chat::params::{SessionParams, ViewMode};
use ticketchat::chat::{ChatSession, Notice, SessionConfig, SessionEvent};
use ticketchat::transport::ConnectionState;
use ticketchat::transport::hub::{HubOptions, WsConnector};
use ticketchat::transport::loopback::LoopbackHub;
use ticketchat_hub::hub::{self as server, HubState};
use ticketchat_proto::api::{HistoryEntry, methods, roles};
use ticketchat_proto::message::{ChatMessage, MessageBody, Origin};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn params() -> SessionParams {
    SessionParams::new(Some(42), Some("ana".into()), Some("carlos".into()), ViewMode::Interactive)
        .unwrap()
}

fn entry(sender: &str, content: &str) -> HistoryEntry {
    HistoryEntry {
        sender: sender.into(),
        content: content.into(),
    }
}

fn live(author: &str, body: &str) -> Vec<Value> {
    vec![json!({"autor": author, "mensagem": body, "papel": roles::TECHNICIAN})]
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

async fn rendered_text(events: &mut mpsc::Receiver<SessionEvent>, text: &str) -> ChatMessage {
    let SessionEvent::Rendered(message) = wait_for(events, |e| {
        matches!(e, SessionEvent::Rendered(m) if m.body == MessageBody::Text(text.into()))
    })
    .await
    else {
        unreachable!()
    };
    message
}

fn texts(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.body.encode()).collect()
}

// ---------------------------------------------------------------------------
// Race orderings (loopback hub)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_first_then_history_renders_once() {
    let hub = LoopbackHub::new();
    let (history, gate) = InMemoryHistory::gated(vec![entry("carlos", "oi"), entry("ana", "bom dia")]);
    let (handle, mut events, task) = ChatSession::spawn(
        params(),
        SessionConfig::default(),
        hub.connector(),
        history,
        InMemoryAttachments::default(),
    );
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Connected))
    })
    .await;

    hub.emit(methods::RECEIVE_MESSAGE, live("carlos", "oi"));
    let first = rendered_text(&mut events, "oi").await;
    assert_eq!(first.origin, Origin::Remote);

    gate.open();
    let marker = rendered_text(&mut events, "bom dia").await;
    assert_eq!(marker.origin, Origin::Local);

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    assert_eq!(texts(&report.messages), vec!["oi", "bom dia"]);
}

#[tokio::test]
async fn history_first_then_live_renders_once() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = ChatSession::spawn(
        params(),
        SessionConfig::default(),
        hub.connector(),
        InMemoryHistory::new(vec![entry("carlos", "oi")]),
        InMemoryAttachments::default(),
    );
    let (mut saw_history, mut saw_connected) = (false, false);
    while !(saw_history && saw_connected) {
        match wait_for(&mut events, |_| true).await {
            SessionEvent::Rendered(m) if m.body == MessageBody::Text("oi".into()) => saw_history = true,
            SessionEvent::ConnectionChanged(ConnectionState::Connected) => saw_connected = true,
            _ => {}
        }
    }

    hub.emit(methods::RECEIVE_MESSAGE, live("carlos", "oi"));
    hub.emit(methods::RECEIVE_MESSAGE, live("carlos", "tudo certo?"));
    rendered_text(&mut events, "tudo certo?").await;

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    assert_eq!(texts(&report.messages), vec!["oi", "tudo certo?"]);
}

#[tokio::test]
async fn history_failure_does_not_block_live_messages() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = ChatSession::spawn(
        params(),
        SessionConfig::default(),
        hub.connector(),
        InMemoryHistory::failing("HTTP 500"),
        InMemoryAttachments::default(),
    );
    wait_for(&mut events, |e| matches!(e, SessionEvent::Notice(Notice::HistoryUnavailable(_)))).await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Connected))
    })
    .await;

    hub.emit(methods::RECEIVE_MESSAGE, live("carlos", "oi"));
    rendered_text(&mut events, "oi").await;

    handle.close().await.unwrap();
    task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Against the real hub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backlog_is_rendered_in_server_order_with_origins() {
    let state = Arc::new(HubState::new());
    let (addr, _server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    state.post_message(42, "carlos", "oi", roles::TECHNICIAN).await;
    state.post_message(42, "Ana", "bom dia", roles::CLIENT).await;
    state.post_message(42, "carlos", "como posso ajudar?", roles::TECHNICIAN).await;
    state.post_message(7, "outro", "outro chamado", roles::CLIENT).await;

    let backend = Backend::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    let (handle, mut events, task) = ChatSession::spawn(
        params(),
        SessionConfig::default(),
        WsConnector::new(&format!("http://{addr}{}", server::HUB_PATH), HubOptions::default()).unwrap(),
        HttpHistory::new(backend.clone()),
        HttpAttachments::new(backend),
    );

    rendered_text(&mut events, "como posso ajudar?").await;
    handle.close().await.unwrap();
    let report = task.await.unwrap();

    assert_eq!(texts(&report.messages), vec!["oi", "bom dia", "como posso ajudar?"]);
    let origins: Vec<Origin> = report.messages.iter().map(|m| m.origin).collect();
    assert_eq!(origins, vec![Origin::Remote, Origin::Local, Origin::Remote]);
}
