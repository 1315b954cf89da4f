// Test-specific lint overrides: property tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Property-based tests for duplicate suppression.
//!
//! Uses proptest to verify:
//! 1. Whatever mix of local sends, live events and history entries arrives,
//!    no render key is rendered twice.
//! 2. A live event authored by the local user is never accepted, whatever
//!    its case or surrounding whitespace.
//! 3. Repeating a wire event never gets it accepted a second time.
//! 4. A message delivered by both history and live renders once, in either
//!    order.

use std::collections::HashSet;

use proptest::prelude::*;
use ticketchat::chat::dedup::{DedupEngine, LiveFilter, Rejection};
use ticketchat_proto::api::LiveMessage;
use ticketchat_proto::message::{ATTACHMENT_PREFIX, RenderKey};

const LOCAL_USER: &str = "ana";

/// One delivery into a session.
#[derive(Debug, Clone)]
enum Arrival {
    LocalSend(String),
    Live(LiveMessage),
    History(String),
}

fn arb_body() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z ]{1,12}",
        "[a-z]{1,8}".prop_map(|name| format!("{ATTACHMENT_PREFIX}http://h/{name}.png")),
        Just("oi".to_string()),
        Just(" OI ".to_string()),
    ]
}

fn arb_author() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("carlos".to_string()),
        Just("beatriz".to_string()),
        Just(LOCAL_USER.to_string()),
        Just(" ANA".to_string()),
    ]
}

fn arb_live() -> impl Strategy<Value = LiveMessage> {
    (arb_author(), arb_body(), prop_oneof![Just("tecnico"), Just("cliente")])
        .prop_map(|(author, body, role)| LiveMessage::new(author, body, role))
}

fn arb_arrival() -> impl Strategy<Value = Arrival> {
    prop_oneof![
        arb_body().prop_map(Arrival::LocalSend),
        arb_live().prop_map(Arrival::Live),
        arb_body().prop_map(Arrival::History),
    ]
}

/// Feed `arrivals` through an engine the way a session does and return the
/// keys that were rendered, in order.
fn render_all(arrivals: &[Arrival]) -> Vec<RenderKey> {
    let mut engine = DedupEngine::new(LOCAL_USER);
    let mut rendered = Vec::new();
    for arrival in arrivals {
        let raw = match arrival {
            Arrival::LocalSend(body) | Arrival::History(body) => body,
            Arrival::Live(event) => {
                if !engine.should_accept(event) {
                    continue;
                }
                &event.body
            }
        };
        let key = RenderKey::from_body(raw);
        if engine.should_render(&key) {
            rendered.push(key);
        }
    }
    rendered
}

proptest! {
    #[test]
    fn no_render_key_is_rendered_twice(arrivals in prop::collection::vec(arb_arrival(), 0..64)) {
        let rendered = render_all(&arrivals);
        let distinct: HashSet<_> = rendered.iter().collect();
        prop_assert_eq!(distinct.len(), rendered.len());
    }

    #[test]
    fn self_echo_is_always_rejected(
        body in arb_body(),
        upper in any::<bool>(),
        pad_left in "[ \t]{0,3}",
        pad_right in "[ \t]{0,3}",
    ) {
        let name = if upper { LOCAL_USER.to_uppercase() } else { LOCAL_USER.to_string() };
        let author = format!("{pad_left}{name}{pad_right}");
        let mut filter = LiveFilter::new(LOCAL_USER);
        prop_assert_eq!(
            filter.accept(&LiveMessage::new(author, body, "cliente")),
            Err(Rejection::SelfEcho)
        );
        prop_assert_eq!(filter.accepted_count(), 0);
    }

    #[test]
    fn repeated_wire_event_is_accepted_at_most_once(event in arb_live(), repeats in 1usize..6) {
        let mut filter = LiveFilter::new(LOCAL_USER);
        let accepted = (0..repeats).filter(|_| filter.accept(&event).is_ok()).count();
        prop_assert!(accepted <= 1);
    }

    #[test]
    fn history_and_live_overlap_renders_once(body in arb_body(), live_first in any::<bool>()) {
        let live = Arrival::Live(LiveMessage::new("carlos", body.clone(), "tecnico"));
        let history = Arrival::History(body);
        let arrivals = if live_first { vec![live, history] } else { vec![history, live] };
        prop_assert_eq!(render_all(&arrivals).len(), 1);
    }
}
