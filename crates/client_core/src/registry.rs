use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use shared::{
    domain::{ChannelId, ConversationId, ServerId},
    protocol::PushEvent,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicScope {
    Any,
    Server(ServerId),
    Channel(ChannelId),
    Conversation(ConversationId),
}

/// A logical event channel: an event name optionally narrowed to one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub event: String,
    pub scope: TopicScope,
}

impl Topic {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            scope: TopicScope::Any,
        }
    }

    pub fn for_server(event: impl Into<String>, server_id: ServerId) -> Self {
        Self {
            event: event.into(),
            scope: TopicScope::Server(server_id),
        }
    }

    pub fn for_channel(event: impl Into<String>, channel_id: ChannelId) -> Self {
        Self {
            event: event.into(),
            scope: TopicScope::Channel(channel_id),
        }
    }

    pub fn for_conversation(event: impl Into<String>, conversation_id: ConversationId) -> Self {
        Self {
            event: event.into(),
            scope: TopicScope::Conversation(conversation_id),
        }
    }

    pub fn matches(&self, event: &PushEvent) -> bool {
        if self.event != event.name() {
            return false;
        }
        let scopes = event.scopes();
        match self.scope {
            TopicScope::Any => true,
            TopicScope::Server(id) => scopes.server_id == Some(id),
            TopicScope::Channel(id) => scopes.channel_id == Some(id),
            TopicScope::Conversation(id) => scopes.conversation_id == Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    handler: EventHandler,
    active: Arc<AtomicBool>,
}

/// Handlers keyed by event name, independent of any connection.
///
/// Dispatch snapshots the matching handlers and calls them outside the lock,
/// so a handler may subscribe or unsubscribe (itself included) while it runs.
/// A handler unsubscribed mid-dispatch is skipped from that point on.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_event: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(subscription = %id, event = %topic.event, scope = ?topic.scope, "registry: subscribed");
        let mut by_event = self.by_event.write().unwrap_or_else(PoisonError::into_inner);
        by_event
            .entry(topic.event.clone())
            .or_default()
            .push(Subscription {
                id,
                topic,
                handler,
                active: Arc::new(AtomicBool::new(true)),
            });
        id
    }

    /// Returns `false` for unknown or already removed ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut by_event = self.by_event.write().unwrap_or_else(PoisonError::into_inner);
        let removed = remove_where(&mut by_event, |subscription| subscription.id == id);
        if removed > 0 {
            debug!(subscription = %id, "registry: unsubscribed");
        }
        removed > 0
    }

    /// Cancels every subscription scoped to `server_id` or one of `channels`.
    pub fn unsubscribe_server_scope(&self, server_id: ServerId, channels: &[ChannelId]) -> usize {
        let mut by_event = self.by_event.write().unwrap_or_else(PoisonError::into_inner);
        let removed = remove_where(&mut by_event, |subscription| match subscription.topic.scope {
            TopicScope::Server(id) => id == server_id,
            TopicScope::Channel(id) => channels.contains(&id),
            TopicScope::Any | TopicScope::Conversation(_) => false,
        });
        if removed > 0 {
            debug!(server_id = %server_id, removed, "registry: dropped server-scoped subscriptions");
        }
        removed
    }

    /// Delivers `event` to every matching handler in subscription order and
    /// returns how many were invoked.
    pub fn dispatch(&self, event: &PushEvent) -> usize {
        let targets: Vec<(EventHandler, Arc<AtomicBool>)> = {
            let by_event = self.by_event.read().unwrap_or_else(PoisonError::into_inner);
            let Some(subscriptions) = by_event.get(event.name()) else {
                return 0;
            };
            subscriptions
                .iter()
                .filter(|subscription| subscription.topic.matches(event))
                .map(|subscription| {
                    (
                        Arc::clone(&subscription.handler),
                        Arc::clone(&subscription.active),
                    )
                })
                .collect()
        };

        let mut delivered = 0;
        for (handler, active) in targets {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            handler(event);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.by_event
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut by_event = self.by_event.write().unwrap_or_else(PoisonError::into_inner);
        remove_where(&mut by_event, |_| true);
    }
}

fn remove_where(
    by_event: &mut HashMap<String, Vec<Subscription>>,
    mut doomed: impl FnMut(&Subscription) -> bool,
) -> usize {
    let mut removed = 0;
    for subscriptions in by_event.values_mut() {
        subscriptions.retain(|subscription| {
            if doomed(subscription) {
                subscription.active.store(false, Ordering::Release);
                removed += 1;
                false
            } else {
                true
            }
        });
    }
    by_event.retain(|_, subscriptions| !subscriptions.is_empty());
    removed
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
