//! Topic patterns and the per-connection subscription registry.
//!
//! A [`TopicSet`] is fixed at configuration time. Every time a connection is
//! established its patterns are resolved against the current identity and
//! one STOMP subscription is opened per resolved destination. Subscriptions
//! are not individually cancellable; they live until the connection ends.

use std::fmt;
use std::sync::Arc;

use slotmap::{Key, SlotMap, new_key_type};

new_key_type! { pub(crate) struct SubscriptionId; }

/// Placeholder replaced by the identity in topic templates.
pub const IDENTITY_PLACEHOLDER: &str = "{id}";

/// What a topic carries; used to tag inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Direct chat messages for the user
    Chat,
    /// Broadcast community interactions
    Interaction,
    /// Notifications for the user
    Notification,
    /// Inbox messages for the user
    Messages,
    /// Anything else
    Custom(String),
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::Chat => f.write_str("chat"),
            TopicKind::Interaction => f.write_str("interaction"),
            TopicKind::Notification => f.write_str("notification"),
            TopicKind::Messages => f.write_str("messages"),
            TopicKind::Custom(name) => f.write_str(name),
        }
    }
}

/// A destination template such as `/topic/chat/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    pub kind: TopicKind,
    pub template: String,
}

impl TopicPattern {
    pub fn new(kind: TopicKind, template: impl Into<String>) -> Self {
        TopicPattern {
            kind,
            template: template.into(),
        }
    }

    /// Whether the template needs an identity.
    pub fn is_scoped(&self) -> bool {
        self.template.contains(IDENTITY_PLACEHOLDER)
    }

    /// Concrete destination for `identity`, or `None` if the pattern is
    /// scoped and there is no identity.
    ///
    /// ```rust
    /// use tokio_stomp_notify::subscription::{TopicKind, TopicPattern};
    ///
    /// let chat = TopicPattern::new(TopicKind::Chat, "/topic/chat/{id}");
    /// assert_eq!(chat.resolve(Some("42")).as_deref(), Some("/topic/chat/42"));
    /// assert_eq!(chat.resolve(None), None);
    ///
    /// let all = TopicPattern::new(TopicKind::Interaction, "/topic/interaction");
    /// assert_eq!(all.resolve(None).as_deref(), Some("/topic/interaction"));
    /// ```
    pub fn resolve(&self, identity: Option<&str>) -> Option<String> {
        if !self.is_scoped() {
            return Some(self.template.clone());
        }
        identity.map(|id| self.template.replace(IDENTITY_PLACEHOLDER, id))
    }
}

/// The fixed set of topics a client subscribes to on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    patterns: Vec<TopicPattern>,
}

impl TopicSet {
    pub fn new(patterns: Vec<TopicPattern>) -> Self {
        TopicSet { patterns }
    }

    /// Chat, broadcast interaction and notification topics.
    pub fn notifications() -> Self {
        TopicSet::new(vec![
            TopicPattern::new(TopicKind::Chat, "/topic/chat/{id}"),
            TopicPattern::new(TopicKind::Interaction, "/topic/interaction"),
            TopicPattern::new(TopicKind::Notification, "/topic/notification/{id}"),
        ])
    }

    /// The per-user inbox topic only.
    pub fn messages() -> Self {
        TopicSet::new(vec![TopicPattern::new(
            TopicKind::Messages,
            "/topic/messages/{id}",
        )])
    }

    pub fn with(mut self, pattern: TopicPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn patterns(&self) -> &[TopicPattern] {
        &self.patterns
    }

    /// Resolves every pattern; scoped ones are skipped without an identity.
    pub fn resolve(&self, identity: Option<&str>) -> Vec<(TopicKind, String)> {
        self.patterns
            .iter()
            .filter_map(|p| p.resolve(identity).map(|dest| (p.kind.clone(), dest)))
            .collect()
    }
}

impl Default for TopicSet {
    fn default() -> Self {
        TopicSet::notifications()
    }
}

/// One open STOMP subscription.
#[derive(Debug)]
pub(crate) struct ActiveSubscription {
    pub(crate) kind: TopicKind,
    pub(crate) destination: Arc<str>,
}

/// Subscriptions of the current connection, keyed by their STOMP `id`.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subs: SlotMap<SubscriptionId, ActiveSubscription>,
}

impl SubscriptionRegistry {
    /// Registers a destination and returns the STOMP subscription id for it.
    pub(crate) fn insert(&mut self, kind: TopicKind, destination: &str) -> String {
        let key = self.subs.insert(ActiveSubscription {
            kind,
            destination: destination.into(),
        });
        Self::wire_id(key)
    }

    pub(crate) fn lookup(&self, wire_id: &str) -> Option<&ActiveSubscription> {
        self.subs
            .iter()
            .find(|(key, _)| Self::wire_id(*key) == wire_id)
            .map(|(_, sub)| sub)
    }

    /// Finds a subscription by destination, for brokers that omit the
    /// `subscription` header.
    pub(crate) fn lookup_destination(&self, destination: &str) -> Option<&ActiveSubscription> {
        self.subs
            .values()
            .find(|sub| &*sub.destination == destination)
    }

    pub(crate) fn destinations(&self) -> Vec<String> {
        self.subs
            .values()
            .map(|sub| sub.destination.to_string())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.subs.clear();
    }

    fn wire_id(key: SubscriptionId) -> String {
        format!("sub-{}", key.data().as_ffi())
    }
}
