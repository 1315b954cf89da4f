//! Message identity and duplicate suppression.
//!
//! Messages reach a session from three sources that share no message IDs:
//! the optimistic local echo, the live push channel and the history fetch.
//! Identity is therefore rebuilt from content, in two independent filters:
//!
//! - [`LiveFilter`] runs on live events only. It drops self-echoes (the
//!   local send path already rendered them) and exact wire repeats of an
//!   `(author, body, role)` tuple.
//! - [`RenderFilter`] runs on every message about to be rendered and lets
//!   each [`RenderKey`] through once per session, whatever its source.
//!
//! Both sets only grow. They live as long as the session that owns them.

use std::collections::HashSet;

use ticketchat_proto::api::LiveMessage;
use ticketchat_proto::message::{RenderKey, same_identity};

/// Why a live event was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The event reports a message the local user sent.
    SelfEcho,
    /// The same `(author, body, role)` was already accepted.
    WireRepeat,
}

/// Wire identity of a live event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WireKey {
    author: String,
    body: String,
    role: String,
}

impl From<&LiveMessage> for WireKey {
    fn from(msg: &LiveMessage) -> Self {
        Self {
            author: msg.author.clone(),
            body: msg.body.clone(),
            role: msg.role.clone(),
        }
    }
}

/// Accept filter for the live channel.
#[derive(Debug)]
pub struct LiveFilter {
    local_user: String,
    accepted: HashSet<WireKey>,
}

impl LiveFilter {
    /// Create a filter for the given local identity.
    #[must_use]
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            accepted: HashSet::new(),
        }
    }

    /// Decide whether a live event should proceed to rendering.
    ///
    /// Self-echoes are rejected without being remembered.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the event is dropped.
    pub fn accept(&mut self, event: &LiveMessage) -> Result<(), Rejection> {
        if same_identity(&event.author, &self.local_user) {
            return Err(Rejection::SelfEcho);
        }
        if self.accepted.insert(WireKey::from(event)) {
            Ok(())
        } else {
            Err(Rejection::WireRepeat)
        }
    }

    /// Number of distinct wire keys accepted so far.
    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

/// Render-once filter shared by all message sources.
#[derive(Debug, Default)]
pub struct RenderFilter {
    rendered: HashSet<RenderKey>,
}

impl RenderFilter {
    /// Record `key` and return whether it was not rendered before.
    pub fn should_render(&mut self, key: &RenderKey) -> bool {
        if self.rendered.contains(key) {
            return false;
        }
        self.rendered.insert(key.clone());
        true
    }

    /// Whether `key` has already been rendered.
    #[must_use]
    pub fn contains(&self, key: &RenderKey) -> bool {
        self.rendered.contains(key)
    }

    /// Number of rendered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    /// Whether nothing has been rendered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }
}

/// Both filters, owned by one session.
#[derive(Debug)]
pub struct DedupEngine {
    live: LiveFilter,
    render: RenderFilter,
}

impl DedupEngine {
    /// Create an engine for `local_user`.
    #[must_use]
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            live: LiveFilter::new(local_user),
            render: RenderFilter::default(),
        }
    }

    /// Live-channel accept filter. See [`LiveFilter::accept`].
    pub fn should_accept(&mut self, event: &LiveMessage) -> bool {
        match self.live.accept(event) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(author = %event.author, ?reason, "live event dropped");
                false
            }
        }
    }

    /// Render-level filter. See [`RenderFilter::should_render`].
    pub fn should_render(&mut self, key: &RenderKey) -> bool {
        let fresh = self.render.should_render(key);
        if !fresh {
            tracing::debug!(render_key = %key, "duplicate render suppressed");
        }
        fresh
    }

    /// Read access to the render filter.
    #[must_use]
    pub const fn render_filter(&self) -> &RenderFilter {
        &self.render
    }
}
