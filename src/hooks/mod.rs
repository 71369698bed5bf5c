//! Hooks Module
//!
//! Callback points the broker runtime fires on its own event path. A hook
//! declares which events it handles through [`Hooks::provides`]; the
//! runtime only calls hooks for events they provide.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::{Connect, ProtocolVersion, Publish, Subscribe, Unsubscribe};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Hook was initialized without the agent it relays to
    MissingAgent,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::MissingAgent => write!(f, "hook initialization requires a cluster agent"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Events a hook can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SessionEstablished,
    Subscribed,
    Unsubscribed,
    Published,
    WillSent,
}

impl HookEvent {
    pub const ALL: [HookEvent; 5] = [
        HookEvent::SessionEstablished,
        HookEvent::Subscribed,
        HookEvent::Unsubscribed,
        HookEvent::Published,
        HookEvent::WillSent,
    ];
}

/// The client an event originated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version,
        }
    }
}

/// Broker hooks trait
///
/// Callbacks run on the broker's event path and must return quickly. All
/// callbacks default to no-ops.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Stable identifier used in logs
    fn id(&self) -> &str;

    /// Whether this hook wants `event`
    fn provides(&self, event: HookEvent) -> bool;

    /// Called after a client's session is established (CONNACK sent)
    async fn on_session_established(&self, _client: &ClientInfo, _packet: &Connect) {}

    /// Called after a SUBSCRIBE has been applied
    async fn on_subscribed(&self, _client: &ClientInfo, _packet: &Subscribe) {}

    /// Called after an UNSUBSCRIBE has been applied
    async fn on_unsubscribed(&self, _client: &ClientInfo, _packet: &Unsubscribe) {}

    /// Called after a client's PUBLISH has been routed to local subscribers
    async fn on_published(&self, _client: &ClientInfo, _packet: &Publish) {}

    /// Called after a disconnecting client's will has been published
    async fn on_will_sent(&self, _client: &ClientInfo, _packet: &Publish) {}
}

/// Implement Hooks for Arc<T> where T: Hooks
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn provides(&self, event: HookEvent) -> bool {
        (**self).provides(event)
    }

    async fn on_session_established(&self, client: &ClientInfo, packet: &Connect) {
        (**self).on_session_established(client, packet).await;
    }

    async fn on_subscribed(&self, client: &ClientInfo, packet: &Subscribe) {
        (**self).on_subscribed(client, packet).await;
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, packet: &Unsubscribe) {
        (**self).on_unsubscribed(client, packet).await;
    }

    async fn on_published(&self, client: &ClientInfo, packet: &Publish) {
        (**self).on_published(client, packet).await;
    }

    async fn on_will_sent(&self, client: &ClientInfo, packet: &Publish) {
        (**self).on_will_sent(client, packet).await;
    }
}

/// Ordered set of registered hooks
///
/// Each event is forwarded, in registration order, to the hooks that
/// provide it.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Register a hook
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        tracing::debug!("registering hook '{}'", hooks.id());
        self.hooks.push(Box::new(hooks));
    }

    /// Register a hook and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn providing(&self, event: HookEvent) -> impl Iterator<Item = &dyn Hooks> {
        self.hooks
            .iter()
            .map(|h| h.as_ref())
            .filter(move |h| h.provides(event))
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    fn id(&self) -> &str {
        "composite"
    }

    fn provides(&self, event: HookEvent) -> bool {
        self.hooks.iter().any(|h| h.provides(event))
    }

    async fn on_session_established(&self, client: &ClientInfo, packet: &Connect) {
        for hooks in self.providing(HookEvent::SessionEstablished) {
            hooks.on_session_established(client, packet).await;
        }
    }

    async fn on_subscribed(&self, client: &ClientInfo, packet: &Subscribe) {
        for hooks in self.providing(HookEvent::Subscribed) {
            hooks.on_subscribed(client, packet).await;
        }
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, packet: &Unsubscribe) {
        for hooks in self.providing(HookEvent::Unsubscribed) {
            hooks.on_unsubscribed(client, packet).await;
        }
    }

    async fn on_published(&self, client: &ClientInfo, packet: &Publish) {
        for hooks in self.providing(HookEvent::Published) {
            hooks.on_published(client, packet).await;
        }
    }

    async fn on_will_sent(&self, client: &ClientInfo, packet: &Publish) {
        for hooks in self.providing(HookEvent::WillSent) {
            hooks.on_will_sent(client, packet).await;
        }
    }
}
