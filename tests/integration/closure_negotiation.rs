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

//! Integration tests for closure negotiation.
//!
//! The technician proposes closing the ticket; the customer has six ticks to
//! answer. Confirming or letting the countdown run out sends exactly one
//! confirmation to the hub; declining sends nothing and keeps the chat open.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ticketchat::backend::Backend;
use ticketchat::chat::attachment::{HttpAttachments, InMemoryAttachments};
use ticketchat::chat::closure::ClosureOutcome;
use ticketchat::chat::history::{HttpHistory, InMemoryHistory};
use ticketchat::chat::params::{SessionParams, ViewMode};
use ticketchat::chat::{
    ChatSession, CloseReason, SessionConfig, SessionEvent, SessionHandle, SessionReport,
};
use ticketchat::transport::ConnectionState;
use ticketchat::transport::hub::{HubOptions, WsConnector};
use ticketchat::transport::loopback::LoopbackHub;
use ticketchat_hub::hub::{self as server, HubState};
use ticketchat_proto::api::methods;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn params() -> SessionParams {
    SessionParams::new(Some(42), Some("ana".into()), Some("carlos".into()), ViewMode::Interactive)
        .unwrap()
}

fn start(
    hub: &LoopbackHub,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    JoinHandle<SessionReport>,
) {
    ChatSession::spawn(
        params(),
        SessionConfig::default(),
        hub.connector(),
        InMemoryHistory::default(),
        InMemoryAttachments::new("http://files.test"),
    )
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event channel closed")
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
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

async fn propose(hub: &LoopbackHub) {
    hub.emit(methods::CLOSURE_PROPOSED, vec![json!(42)]);
    hub.flush().await;
}

// ---------------------------------------------------------------------------
// Countdown behavior (loopback hub, paused clock)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expiry_sends_exactly_one_confirmation() {
    let hub = LoopbackHub::new();
    let (_handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    propose(&hub).await;
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::ClosureProposed { remaining_secs: 6 }
    );
    for remaining_secs in (1..=5).rev() {
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ClosureCountdown { remaining_secs }
        );
    }
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Closed(CloseReason::CountdownExpired)
    );

    let report = task.await.unwrap();
    assert_eq!(report.closure, Some(ClosureOutcome::ConfirmedClosed));
    assert_eq!(hub.invocations_of(methods::CONFIRM_CLOSURE), vec![vec![json!(42)]]);
    assert!(!hub.is_client_connected());
}

#[tokio::test(start_paused = true)]
async fn confirming_closes_immediately() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    propose(&hub).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::ClosureProposed { .. })).await;
    handle.confirm_closure().await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Closed(CloseReason::ConfirmedByUser))
    })
    .await;
    task.await.unwrap();
    assert_eq!(hub.invocations_of(methods::CONFIRM_CLOSURE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn declining_sends_nothing_and_keeps_the_chat_open() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    propose(&hub).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::ClosureProposed { .. })).await;
    handle.decline_closure().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::ClosureDeclined)).await;

    // Well past the original deadline.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(hub.invocations_of(methods::CONFIRM_CLOSURE).is_empty());
    assert!(!task.is_finished());

    handle.send_text("ainda preciso de ajuda").await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Rendered(_))).await;

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    assert_eq!(report.closure, Some(ClosureOutcome::Declined));
    assert_eq!(report.reason, CloseReason::UserLeft);
}

#[tokio::test(start_paused = true)]
async fn a_second_proposal_does_not_restart_the_countdown() {
    let hub = LoopbackHub::new();
    let (_handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    propose(&hub).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::ClosureProposed { .. })).await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ClosureCountdown { remaining_secs: 4 })
    })
    .await;
    propose(&hub).await;

    let mut remaining = Vec::new();
    loop {
        match next_event(&mut events).await {
            SessionEvent::ClosureCountdown { remaining_secs } => remaining.push(remaining_secs),
            SessionEvent::ClosureProposed { .. } => panic!("countdown restarted"),
            SessionEvent::Closed(reason) => {
                assert_eq!(reason, CloseReason::CountdownExpired);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(remaining, vec![3, 2, 1]);
    task.await.unwrap();
    assert_eq!(hub.invocations_of(methods::CONFIRM_CLOSURE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expiry_while_disconnected_closes_without_confirmation() {
    let hub = LoopbackHub::new();
    let (_handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    propose(&hub).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::ClosureProposed { .. })).await;
    hub.drop_connection();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Closed(CloseReason::CountdownExpired))
    })
    .await;
    task.await.unwrap();
    assert!(hub.invocations_of(methods::CONFIRM_CLOSURE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn answers_without_a_proposal_are_ignored() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = start(&hub);
    connected(&mut events).await;

    handle.confirm_closure().await.unwrap();
    handle.decline_closure().await.unwrap();
    handle.send_text("oi").await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Rendered(_)));

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    assert_eq!(report.closure, None);
    assert!(hub.invocations_of(methods::CONFIRM_CLOSURE).is_empty());
}

// ---------------------------------------------------------------------------
// Against the real hub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expiry_finalizes_the_ticket_on_the_hub() {
    let state = Arc::new(HubState::new());
    let (addr, _server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let backend = Backend::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    let config = SessionConfig {
        tick_period: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let (_handle, mut events, task) = ChatSession::spawn(
        params(),
        config,
        WsConnector::new(&format!("http://{addr}{}", server::HUB_PATH), HubOptions::default()).unwrap(),
        HttpHistory::new(backend.clone()),
        HttpAttachments::new(backend),
    );
    connected(&mut events).await;

    state.notify_closure(42).await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Closed(CloseReason::CountdownExpired))
    })
    .await;
    task.await.unwrap();

    // The confirmation is sent before the session closes.
    assert!(state.store.is_finalized(42).await);
}
