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

//! Integration tests for the attachment pipeline.
//!
//! A file is uploaded over multipart, rendered locally once the upload
//! succeeded, and announced to the ticket as a `file:<url>` message. Image
//! attachments are then fetched for inline display.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ticketchat::backend::Backend;
use ticketchat::chat::attachment::{
    AttachmentService, HttpAttachments, InMemoryAttachments, LocalFile, UploadError,
};
use ticketchat::chat::history::{HttpHistory, InMemoryHistory};
use ticketchat::chat::params::{SessionParams, ViewMode};
use ticketchat::chat::{
    ChatSession, Notice, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionReport,
};
use ticketchat::transport::ConnectionState;
use ticketchat::transport::hub::{HubOptions, WsConnector};
use ticketchat::transport::loopback::LoopbackHub;
use ticketchat_hub::hub::{self as server, HubState};
use ticketchat_proto::api::{methods, roles};
use ticketchat_proto::message::{AttachmentReference, MediaKind, MessageBody, Origin};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

fn params(mode: ViewMode) -> SessionParams {
    SessionParams::new(Some(42), Some("ana".into()), Some("carlos".into()), mode).unwrap()
}

struct Fixture {
    state: Arc<HubState>,
    base: String,
    backend: Backend,
    _dir: tempfile::TempDir,
    dir: PathBuf,
}

impl Fixture {
    async fn start() -> Self {
        let state = Arc::new(HubState::new());
        let (addr, _server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        let base = format!("http://{addr}");
        let backend = Backend::new(&base, Duration::from_secs(5)).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        Self {
            state,
            base,
            backend,
            _dir: tmp,
            dir,
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn session(
        &self,
        mode: ViewMode,
    ) -> (
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
        JoinHandle<SessionReport>,
    ) {
        ChatSession::spawn(
            params(mode),
            SessionConfig::default(),
            WsConnector::new(&format!("{}{}", self.base, server::HUB_PATH), HubOptions::default())
                .unwrap(),
            HttpHistory::new(self.backend.clone()),
            HttpAttachments::new(self.backend.clone()),
        )
    }
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

async fn rendered_attachment(events: &mut mpsc::Receiver<SessionEvent>) -> (Origin, AttachmentReference) {
    let SessionEvent::Rendered(message) = wait_for(events, |e| {
        matches!(e, SessionEvent::Rendered(m) if m.body.attachment().is_some())
    })
    .await
    else {
        unreachable!()
    };
    let MessageBody::Attachment(reference) = message.body else {
        unreachable!()
    };
    (message.origin, reference)
}

// ---------------------------------------------------------------------------
// Upload through the session (real hub)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_upload_renders_announces_and_loads_inline() {
    let fixture = Fixture::start().await;
    let path = fixture.write("f.png", PNG_BYTES);
    let (handle, mut events, task) = fixture.session(ViewMode::Interactive);
    connected(&mut events).await;

    handle.attach(&path).await.unwrap();

    let (origin, reference) = rendered_attachment(&mut events).await;
    assert_eq!(origin, Origin::Local);
    assert_eq!(reference.media_kind, MediaKind::Image);
    assert_eq!(reference.display_name, "f.png");
    assert!(reference.remote_url.starts_with(&format!("{}/uploads/", fixture.base)));

    let SessionEvent::InlineMedia { bytes, .. } =
        wait_for(&mut events, |e| matches!(e, SessionEvent::InlineMedia { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(bytes, PNG_BYTES);

    // The upload endpoint logs the file, and the session announces it.
    let announced = format!("file:{}", reference.remote_url);
    for _ in 0..100 {
        if fixture.state.store.history(42).await.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let history = fixture.state.store.history(42).await;
    assert!(history.iter().all(|e| e.sender == "ana" && e.content == announced));
    assert_eq!(history.len(), 2);

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    let attachments = report
        .messages
        .iter()
        .filter(|m| m.body.attachment().is_some())
        .count();
    assert_eq!(attachments, 1, "self echoes must not render twice");
}

#[tokio::test]
async fn document_upload_is_a_generic_file() {
    let fixture = Fixture::start().await;
    let path = fixture.write("relatorio.pdf", b"%PDF-1.4");
    let (handle, mut events, task) = fixture.session(ViewMode::Interactive);
    connected(&mut events).await;

    handle.attach(&path).await.unwrap();
    let (_, reference) = rendered_attachment(&mut events).await;
    assert_eq!(reference.media_kind, MediaKind::GenericFile);
    assert_eq!(reference.display_name, "relatorio.pdf");

    handle.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn rejected_upload_renders_nothing() {
    let fixture = Fixture::start().await;
    let path = fixture.write("f.zip", b"PK\x03\x04");
    let (handle, mut events, task) = fixture.session(ViewMode::Interactive);
    connected(&mut events).await;

    handle.attach(&path).await.unwrap();
    let SessionEvent::Notice(Notice::UploadFailed(reason)) = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Notice(Notice::UploadFailed(_)))
    })
    .await
    else {
        unreachable!()
    };
    assert!(reason.contains("não permitido"));

    handle.close().await.unwrap();
    let report = task.await.unwrap();
    assert!(report.messages.is_empty());
    assert!(fixture.state.store.history(42).await.is_empty());
}

#[tokio::test]
async fn missing_file_is_reported() {
    let fixture = Fixture::start().await;
    let (handle, mut events, task) = fixture.session(ViewMode::Interactive);
    connected(&mut events).await;

    handle.attach(fixture.dir.join("sumiu.png")).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Notice(Notice::UploadFailed(_)))).await;

    handle.close().await.unwrap();
    assert!(task.await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn read_only_session_cannot_attach() {
    let fixture = Fixture::start().await;
    let path = fixture.write("f.png", PNG_BYTES);
    let (handle, _events, task) = fixture.session(ViewMode::ReadOnly);

    assert_eq!(handle.attach(&path).await, Err(SessionError::ReadOnly));

    handle.close().await.unwrap();
    task.await.unwrap();
    assert!(fixture.state.store.history(42).await.is_empty());
}

#[tokio::test]
async fn attachment_from_technician_uses_url_name() {
    let fixture = Fixture::start().await;
    let (handle, mut events, task) = fixture.session(ViewMode::Interactive);
    connected(&mut events).await;

    let url = format!("{}/uploads/0192-abc.pdf", fixture.base);
    fixture
        .state
        .post_message(42, "carlos", &format!("file:{url}"), roles::TECHNICIAN)
        .await;

    let (origin, reference) = rendered_attachment(&mut events).await;
    assert_eq!(origin, Origin::Remote);
    assert_eq!(reference.display_name, "0192-abc.pdf");
    assert_eq!(reference.remote_url, url);

    handle.close().await.unwrap();
    task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Service level
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_service_sends_ticket_and_user() {
    let fixture = Fixture::start().await;
    let service = HttpAttachments::new(fixture.backend.clone());

    let reference = service
        .upload(LocalFile::new("nota.txt", b"ok".to_vec()), &params(ViewMode::Interactive))
        .await
        .unwrap();
    assert_eq!(reference.media_kind, MediaKind::GenericFile);
    assert_eq!(service.fetch_inline(&reference.remote_url).await.unwrap(), b"ok");

    let history = fixture.state.store.history(42).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender, "ana");
}

#[tokio::test]
async fn http_service_surfaces_rejection_reason() {
    let fixture = Fixture::start().await;
    let service = HttpAttachments::new(fixture.backend.clone());

    let result = service
        .upload(LocalFile::new("vazio.png", Vec::new()), &params(ViewMode::Interactive))
        .await;
    assert!(matches!(result, Err(UploadError::Rejected { status: 400, .. })));
}

#[tokio::test]
async fn zip_attachment_is_a_generic_file() {
    let hub = LoopbackHub::new();
    let (handle, mut events, task) = ChatSession::spawn(
        params(ViewMode::Interactive),
        SessionConfig::default(),
        hub.connector(),
        InMemoryHistory::default(),
        InMemoryAttachments::new("http://files.test/uploads"),
    );
    connected(&mut events).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.zip");
    std::fs::write(&path, b"PK").unwrap();
    handle.attach(&path).await.unwrap();

    let (_, reference) = rendered_attachment(&mut events).await;
    assert_eq!(reference.media_kind, MediaKind::GenericFile);
    assert_eq!(reference.encode(), "file:http://files.test/uploads/f.zip");

    handle.close().await.unwrap();
    task.await.unwrap();
    let sent = hub.invocations_of(methods::SEND_MESSAGE);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][2], "file:http://files.test/uploads/f.zip");
}
