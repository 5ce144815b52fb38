//! Process-wide view of servers, channels, rosters, conversations and
//! message streams.
//!
//! Every change happens inside one write-lock section, so readers see either
//! the state before a push or the state after it. Changes are announced on a
//! broadcast channel once the lock is released.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ConversationId, MessageId, ServerId, UserId},
    protocol::{
        BanSummary, ChannelSummary, ConversationSummary, MemberSummary, MessagePayload,
        MessageScope, PushEvent, ServerSummary,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    domain::{ConversationDirectory, ServerRoster},
    error::ClientResult,
};

/// List-shaped queries. These are invalidated and refetched, never patched
/// with structural changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    ServerList,
    ChannelList(ServerId),
    MemberList(ServerId),
    BanList(ServerId),
    ConversationList,
}

impl QueryKey {
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            QueryKey::ChannelList(id) | QueryKey::MemberList(id) | QueryKey::BanList(id) => {
                Some(*id)
            }
            QueryKey::ServerList | QueryKey::ConversationList => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Fresh,
    Stale,
    Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    Conversation(ConversationId),
}

impl From<MessageScope> for StreamKey {
    fn from(scope: MessageScope) -> Self {
        match scope {
            MessageScope::Channel {
                server_id,
                channel_id,
            } => StreamKey::Channel {
                server_id,
                channel_id,
            },
            MessageScope::Conversation { conversation_id } => {
                StreamKey::Conversation(conversation_id)
            }
        }
    }
}

impl From<StreamKey> for MessageScope {
    fn from(stream: StreamKey) -> Self {
        match stream {
            StreamKey::Channel {
                server_id,
                channel_id,
            } => MessageScope::Channel {
                server_id,
                channel_id,
            },
            StreamKey::Conversation(conversation_id) => {
                MessageScope::Conversation { conversation_id }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The initial fetch is running; pushes are held back until it lands.
    Loading,
    Open,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub message: MessagePayload,
    /// Applied locally, not yet confirmed by acknowledgement or echo.
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Invalidated(QueryKey),
    QueryLoaded(QueryKey),
    ServerChanged(ServerId),
    ServerRemoved(ServerId),
    ChannelChanged {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    MembersChanged(ServerId),
    OwnershipChanged {
        server_id: ServerId,
        owner_id: UserId,
    },
    StreamOpened(StreamKey),
    MessageUpserted {
        stream: StreamKey,
        message_id: MessageId,
    },
    MessageRemoved {
        stream: StreamKey,
        message_id: MessageId,
    },
    ConversationAdded(ConversationId),
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    Cleared,
}

/// What applying a push did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEffect {
    Applied,
    /// Held for a stream that is still loading.
    Buffered,
    /// Nothing local references the entity, or the change is already known.
    Ignored,
    /// The local user lost access to the server; its data is gone.
    LeftServer {
        server_id: ServerId,
        channels: Vec<ChannelId>,
    },
}

#[derive(Debug, Clone)]
enum StreamOp {
    Created(MessagePayload),
    Updated(MessagePayload),
    Deleted(MessageId),
}

struct MessageStream {
    state: StreamState,
    ordered: BTreeMap<(DateTime<Utc>, MessageId), CachedMessage>,
    index: HashMap<MessageId, DateTime<Utc>>,
    buffered: Vec<StreamOp>,
}

impl MessageStream {
    fn loading() -> Self {
        Self {
            state: StreamState::Loading,
            ordered: BTreeMap::new(),
            index: HashMap::new(),
            buffered: Vec::new(),
        }
    }

    fn get(&self, message_id: MessageId) -> Option<&CachedMessage> {
        let created_at = self.index.get(&message_id)?;
        self.ordered.get(&(*created_at, message_id))
    }

    /// Keyed by id: a second copy of the same message replaces the first
    /// instead of being added. Older edits never overwrite newer ones.
    fn upsert(&mut self, message: MessagePayload, create: bool, pending: bool) -> bool {
        let message_id = message.message_id;
        match self.get(message_id) {
            Some(existing) => {
                if pending && !existing.pending {
                    return false;
                }
                if !existing.pending && message.updated_at < existing.message.updated_at {
                    return false;
                }
                if !existing.pending && !pending && existing.message == message {
                    return false;
                }
            }
            None if !create => return false,
            None => {}
        }
        self.take(message_id);
        self.index.insert(message_id, message.created_at);
        self.ordered.insert(
            (message.created_at, message_id),
            CachedMessage { message, pending },
        );
        true
    }

    fn take(&mut self, message_id: MessageId) -> Option<CachedMessage> {
        let created_at = self.index.remove(&message_id)?;
        self.ordered.remove(&(created_at, message_id))
    }

    fn apply(&mut self, op: StreamOp) -> Option<MessageId> {
        match op {
            StreamOp::Created(message) => {
                let id = message.message_id;
                self.upsert(message, true, false).then_some(id)
            }
            StreamOp::Updated(message) => {
                let id = message.message_id;
                self.upsert(message, false, false).then_some(id)
            }
            StreamOp::Deleted(id) => self.take(id).map(|_| id),
        }
    }

    fn snapshot(&self) -> Vec<CachedMessage> {
        self.ordered.values().cloned().collect()
    }
}

#[derive(Default)]
struct CacheState {
    local_user: Option<UserId>,
    servers: BTreeMap<ServerId, ServerSummary>,
    channels: HashMap<ServerId, BTreeMap<ChannelId, ChannelSummary>>,
    rosters: HashMap<ServerId, ServerRoster>,
    unattached_bans: HashMap<ServerId, Vec<BanSummary>>,
    conversations: ConversationDirectory,
    streams: HashMap<StreamKey, MessageStream>,
    queries: HashMap<QueryKey, QueryState>,
    dirty_while_loading: HashSet<QueryKey>,
    presence: HashSet<UserId>,
}

impl CacheState {
    fn invalidate(&mut self, key: QueryKey, events: &mut Vec<CacheEvent>) {
        match self.queries.get_mut(&key) {
            Some(QueryState::Fresh) => {
                self.queries.insert(key, QueryState::Stale);
                events.push(CacheEvent::Invalidated(key));
            }
            // The fetch in flight may predate the change.
            Some(QueryState::Loading) => {
                self.dirty_while_loading.insert(key);
            }
            Some(QueryState::Stale) | None => {}
        }
    }

    fn finish_load(&mut self, key: QueryKey, events: &mut Vec<CacheEvent>) {
        events.push(CacheEvent::QueryLoaded(key));
        if self.dirty_while_loading.remove(&key) {
            self.queries.insert(key, QueryState::Stale);
            events.push(CacheEvent::Invalidated(key));
        } else {
            self.queries.insert(key, QueryState::Fresh);
        }
    }

    /// Drops a server and everything scoped to it.
    fn remove_server(&mut self, server_id: ServerId, events: &mut Vec<CacheEvent>) -> Vec<ChannelId> {
        self.servers.remove(&server_id);
        let mut channels: BTreeSet<ChannelId> = self
            .channels
            .remove(&server_id)
            .map(|channels| channels.into_keys().collect())
            .unwrap_or_default();
        self.rosters.remove(&server_id);
        self.unattached_bans.remove(&server_id);
        // Open streams may name channels the channel list never loaded.
        self.streams.retain(|key, _| match key {
            StreamKey::Channel {
                server_id: owner,
                channel_id,
            } if *owner == server_id => {
                channels.insert(*channel_id);
                false
            }
            _ => true,
        });
        self.queries.retain(|key, _| key.server_id() != Some(server_id));
        self.dirty_while_loading
            .retain(|key| key.server_id() != Some(server_id));
        events.push(CacheEvent::ServerRemoved(server_id));
        channels.into_iter().collect()
    }

    fn stream_op(&mut self, stream: StreamKey, op: StreamOp, events: &mut Vec<CacheEvent>) -> CacheEffect {
        let Some(entry) = self.streams.get_mut(&stream) else {
            return CacheEffect::Ignored;
        };
        if entry.state == StreamState::Loading {
            entry.buffered.push(op);
            return CacheEffect::Buffered;
        }
        let removal = matches!(op, StreamOp::Deleted(_));
        match entry.apply(op) {
            Some(message_id) if removal => {
                events.push(CacheEvent::MessageRemoved { stream, message_id });
                CacheEffect::Applied
            }
            Some(message_id) => {
                events.push(CacheEvent::MessageUpserted { stream, message_id });
                CacheEffect::Applied
            }
            None => CacheEffect::Ignored,
        }
    }

    fn is_local(&self, user_id: UserId) -> bool {
        self.local_user == Some(user_id)
    }

    fn server_removed_for_local(
        &mut self,
        server_id: ServerId,
        events: &mut Vec<CacheEvent>,
    ) -> CacheEffect {
        let channels = self.remove_server(server_id, events);
        self.invalidate(QueryKey::ServerList, events);
        CacheEffect::LeftServer {
            server_id,
            channels,
        }
    }

    fn apply_owner_change(
        &mut self,
        server_id: ServerId,
        previous_owner: UserId,
        new_owner: UserId,
        events: &mut Vec<CacheEvent>,
    ) -> CacheEffect {
        let mut changed = false;
        if let Some(server) = self.servers.get_mut(&server_id) {
            if server.owner_id != new_owner {
                server.owner_id = new_owner;
                changed = true;
            }
        }
        if let Some(roster) = self.rosters.get_mut(&server_id) {
            if roster.owner_id() != new_owner {
                if roster.apply_owner_changed(previous_owner, new_owner) {
                    changed = true;
                } else {
                    // The new owner is not in the cached roster.
                    self.invalidate(QueryKey::MemberList(server_id), events);
                }
            }
        }
        if changed {
            events.push(CacheEvent::OwnershipChanged {
                server_id,
                owner_id: new_owner,
            });
            CacheEffect::Applied
        } else {
            CacheEffect::Ignored
        }
    }

    fn apply_push(&mut self, event: &PushEvent, events: &mut Vec<CacheEvent>) -> CacheEffect {
        match event {
            PushEvent::ServerUpdated { server } => match self.servers.get_mut(&server.server_id) {
                Some(existing) => {
                    let owner_id = existing.owner_id;
                    *existing = ServerSummary {
                        owner_id,
                        ..server.clone()
                    };
                    events.push(CacheEvent::ServerChanged(server.server_id));
                    CacheEffect::Applied
                }
                None => {
                    self.invalidate(QueryKey::ServerList, events);
                    CacheEffect::Ignored
                }
            },
            PushEvent::ServerDeleted { server_id } => {
                if !self.servers.contains_key(server_id) {
                    return CacheEffect::Ignored;
                }
                self.server_removed_for_local(*server_id, events)
            }
            PushEvent::ServerOwnerChanged {
                server_id,
                previous_owner_id,
                new_owner_id,
            } => self.apply_owner_change(*server_id, *previous_owner_id, *new_owner_id, events),
            PushEvent::MemberJoined { member } => {
                if self.is_local(member.user_id) {
                    self.invalidate(QueryKey::ServerList, events);
                }
                self.invalidate(QueryKey::MemberList(member.server_id), events);
                CacheEffect::Applied
            }
            PushEvent::MemberLeft { server_id, user_id }
            | PushEvent::MemberKicked { server_id, user_id } => {
                if self.is_local(*user_id) {
                    return self.server_removed_for_local(*server_id, events);
                }
                if let Some(roster) = self.rosters.get_mut(server_id) {
                    if roster.apply_removed(*user_id) {
                        events.push(CacheEvent::MembersChanged(*server_id));
                    }
                }
                self.invalidate(QueryKey::MemberList(*server_id), events);
                CacheEffect::Applied
            }
            PushEvent::MemberBanned { ban } => {
                if self.is_local(ban.user_id) {
                    return self.server_removed_for_local(ban.server_id, events);
                }
                if let Some(roster) = self.rosters.get_mut(&ban.server_id) {
                    if roster.apply_banned(ban.clone()) {
                        events.push(CacheEvent::MembersChanged(ban.server_id));
                    }
                }
                self.invalidate(QueryKey::MemberList(ban.server_id), events);
                self.invalidate(QueryKey::BanList(ban.server_id), events);
                CacheEffect::Applied
            }
            PushEvent::MemberUnbanned { server_id, user_id } => {
                if let Some(roster) = self.rosters.get_mut(server_id) {
                    if roster.apply_unbanned(*user_id) {
                        events.push(CacheEvent::MembersChanged(*server_id));
                    }
                }
                self.invalidate(QueryKey::BanList(*server_id), events);
                CacheEffect::Applied
            }
            PushEvent::MemberRoleChanged {
                server_id,
                user_id,
                role,
            } => {
                let Some(roster) = self.rosters.get_mut(server_id) else {
                    return CacheEffect::Ignored;
                };
                if roster.apply_role_changed(*user_id, *role) {
                    events.push(CacheEvent::MembersChanged(*server_id));
                    CacheEffect::Applied
                } else {
                    CacheEffect::Ignored
                }
            }
            PushEvent::ChannelCreated { channel } => {
                self.invalidate(QueryKey::ChannelList(channel.server_id), events);
                CacheEffect::Applied
            }
            PushEvent::ChannelUpdated { channel } => {
                let Some(existing) = self
                    .channels
                    .get_mut(&channel.server_id)
                    .and_then(|channels| channels.get_mut(&channel.channel_id))
                else {
                    return CacheEffect::Ignored;
                };
                *existing = channel.clone();
                events.push(CacheEvent::ChannelChanged {
                    server_id: channel.server_id,
                    channel_id: channel.channel_id,
                });
                CacheEffect::Applied
            }
            PushEvent::ChannelDeleted {
                server_id,
                channel_id,
            } => {
                if let Some(channels) = self.channels.get_mut(server_id) {
                    if channels.remove(channel_id).is_some() {
                        events.push(CacheEvent::ChannelChanged {
                            server_id: *server_id,
                            channel_id: *channel_id,
                        });
                    }
                }
                self.streams.remove(&StreamKey::Channel {
                    server_id: *server_id,
                    channel_id: *channel_id,
                });
                self.invalidate(QueryKey::ChannelList(*server_id), events);
                CacheEffect::Applied
            }
            PushEvent::MessageCreated { message } | PushEvent::PrivateMessageCreated { message } => {
                self.stream_op(
                    message.scope.into(),
                    StreamOp::Created(message.clone()),
                    events,
                )
            }
            PushEvent::MessageUpdated { message } | PushEvent::PrivateMessageUpdated { message } => {
                self.stream_op(
                    message.scope.into(),
                    StreamOp::Updated(message.clone()),
                    events,
                )
            }
            PushEvent::MessageDeleted {
                server_id,
                channel_id,
                message_id,
            } => self.stream_op(
                StreamKey::Channel {
                    server_id: *server_id,
                    channel_id: *channel_id,
                },
                StreamOp::Deleted(*message_id),
                events,
            ),
            PushEvent::PrivateMessageDeleted {
                conversation_id,
                message_id,
            } => self.stream_op(
                StreamKey::Conversation(*conversation_id),
                StreamOp::Deleted(*message_id),
                events,
            ),
            PushEvent::ConversationCreated { conversation } => {
                if let Some(local) = self.local_user {
                    if !conversation.involves(local) {
                        return CacheEffect::Ignored;
                    }
                }
                match self.conversations.insert(conversation.clone()) {
                    Ok(true) => {
                        events.push(CacheEvent::ConversationAdded(conversation.conversation_id));
                        CacheEffect::Applied
                    }
                    Ok(false) => CacheEffect::Ignored,
                    Err(err) => {
                        warn!("cache: conflicting conversation push: {err}");
                        self.invalidate(QueryKey::ConversationList, events);
                        CacheEffect::Ignored
                    }
                }
            }
            PushEvent::PresenceOnline { user_id } => {
                if self.presence.insert(*user_id) {
                    events.push(CacheEvent::PresenceChanged {
                        user_id: *user_id,
                        online: true,
                    });
                    CacheEffect::Applied
                } else {
                    CacheEffect::Ignored
                }
            }
            PushEvent::PresenceOffline { user_id } => {
                if self.presence.remove(user_id) {
                    events.push(CacheEvent::PresenceChanged {
                        user_id: *user_id,
                        online: false,
                    });
                    CacheEffect::Applied
                } else {
                    CacheEffect::Ignored
                }
            }
        }
    }
}

/// The shared cache. Only the synchronization paths write to it; everyone
/// else reads snapshots.
pub struct EntityCache {
    state: RwLock<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(CacheState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn set_local_user(&self, user_id: Option<UserId>) {
        self.write(|state, _| state.local_user = user_id);
    }

    pub fn local_user(&self) -> Option<UserId> {
        self.read().local_user
    }

    /// Drops everything, e.g. when the session ends.
    pub fn clear(&self) {
        self.write(|state, events| {
            *state = CacheState::default();
            events.push(CacheEvent::Cleared);
        });
        info!("cache: cleared");
    }

    pub fn apply_push(&self, event: &PushEvent) -> CacheEffect {
        let effect = self.write(|state, events| state.apply_push(event, events));
        debug!(event = event.name(), effect = ?effect, "cache: applied push");
        effect
    }

    // Queries.

    pub fn query_state(&self, key: QueryKey) -> Option<QueryState> {
        self.read().queries.get(&key).copied()
    }

    /// Queries that were invalidated and are waiting to be refetched.
    pub fn stale_queries(&self) -> Vec<QueryKey> {
        self.read()
            .queries
            .iter()
            .filter(|(_, state)| **state == QueryState::Stale)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn begin_load(&self, key: QueryKey) {
        self.write(|state, _| {
            state.queries.insert(key, QueryState::Loading);
        });
    }

    /// Marks a loaded query stale. A query never loaded is left alone.
    pub fn invalidate(&self, key: QueryKey) {
        self.write(|state, events| state.invalidate(key, events));
    }

    /// Restores the stale flag after a failed fetch.
    pub fn fail_load(&self, key: QueryKey) {
        self.write(|state, _| {
            state.dirty_while_loading.remove(&key);
            state.queries.insert(key, QueryState::Stale);
        });
    }

    pub fn load_servers(&self, servers: Vec<ServerSummary>) {
        self.write(|state, events| {
            let incoming: BTreeMap<ServerId, ServerSummary> = servers
                .into_iter()
                .map(|server| (server.server_id, server))
                .collect();
            let gone: Vec<ServerId> = state
                .servers
                .keys()
                .filter(|id| !incoming.contains_key(id))
                .copied()
                .collect();
            for server_id in gone {
                state.remove_server(server_id, events);
            }
            state.servers = incoming;
            state.finish_load(QueryKey::ServerList, events);
        });
    }

    pub fn load_channels(&self, server_id: ServerId, channels: Vec<ChannelSummary>) {
        self.write(|state, events| {
            let channels: BTreeMap<ChannelId, ChannelSummary> = channels
                .into_iter()
                .filter(|channel| channel.server_id == server_id)
                .map(|channel| (channel.channel_id, channel))
                .collect();
            state.streams.retain(|key, _| match key {
                StreamKey::Channel {
                    server_id: owner,
                    channel_id,
                } => *owner != server_id || channels.contains_key(channel_id),
                StreamKey::Conversation(_) => true,
            });
            state.channels.insert(server_id, channels);
            state.finish_load(QueryKey::ChannelList(server_id), events);
        });
    }

    pub fn load_members(&self, server_id: ServerId, members: Vec<MemberSummary>) -> ClientResult<()> {
        self.write(|state, events| -> ClientResult<()> {
            let bans: Vec<BanSummary> = match state.rosters.get(&server_id) {
                Some(roster) => roster.bans().cloned().collect(),
                None => state.unattached_bans.remove(&server_id).unwrap_or_default(),
            };
            // Bans win over a membership the fetched list still shows.
            let members: Vec<MemberSummary> = members
                .into_iter()
                .filter(|member| !bans.iter().any(|ban| ban.user_id == member.user_id))
                .collect();
            match ServerRoster::from_parts(server_id, members, bans) {
                Ok(roster) => {
                    if let Some(server) = state.servers.get_mut(&server_id) {
                        server.owner_id = roster.owner_id();
                    }
                    state.rosters.insert(server_id, roster);
                    events.push(CacheEvent::MembersChanged(server_id));
                    state.finish_load(QueryKey::MemberList(server_id), events);
                    Ok(())
                }
                Err(err) => {
                    warn!(server_id = %server_id, "cache: rejected member list: {err}");
                    state.queries.insert(QueryKey::MemberList(server_id), QueryState::Stale);
                    Err(err.into())
                }
            }
        })
    }

    pub fn load_bans(&self, server_id: ServerId, bans: Vec<BanSummary>) {
        self.write(|state, events| {
            let bans: Vec<BanSummary> = bans
                .into_iter()
                .filter(|ban| ban.server_id == server_id)
                .collect();
            match state.rosters.get_mut(&server_id) {
                Some(roster) => {
                    roster.replace_bans(bans);
                    events.push(CacheEvent::MembersChanged(server_id));
                }
                None => {
                    state.unattached_bans.insert(server_id, bans);
                }
            }
            state.finish_load(QueryKey::BanList(server_id), events);
        });
    }

    pub fn load_conversations(&self, conversations: Vec<ConversationSummary>) {
        self.write(|state, events| {
            let mut directory = ConversationDirectory::new();
            for conversation in conversations {
                if let Err(err) = directory.insert(conversation) {
                    warn!("cache: skipping conversation: {err}");
                }
            }
            state.conversations = directory;
            state.finish_load(QueryKey::ConversationList, events);
        });
    }

    /// Records a conversation the local user just opened.
    pub fn insert_conversation(&self, conversation: ConversationSummary) -> ClientResult<()> {
        self.write(|state, events| -> ClientResult<()> {
            if state.conversations.insert(conversation.clone())? {
                events.push(CacheEvent::ConversationAdded(conversation.conversation_id));
            }
            Ok(())
        })
    }

    /// Same transaction as the push: both roles change together.
    pub fn apply_ownership_change(
        &self,
        server_id: ServerId,
        previous_owner: UserId,
        new_owner: UserId,
    ) -> CacheEffect {
        self.write(|state, events| {
            state.apply_owner_change(server_id, previous_owner, new_owner, events)
        })
    }

    /// Removes a server the local user left or deleted.
    pub fn remove_server(&self, server_id: ServerId) -> Vec<ChannelId> {
        self.write(|state, events| {
            if !state.servers.contains_key(&server_id) {
                return Vec::new();
            }
            let channels = state.remove_server(server_id, events);
            state.invalidate(QueryKey::ServerList, events);
            channels
        })
    }

    // Reads.

    pub fn servers(&self) -> Vec<ServerSummary> {
        self.read().servers.values().cloned().collect()
    }

    pub fn server(&self, server_id: ServerId) -> Option<ServerSummary> {
        self.read().servers.get(&server_id).cloned()
    }

    pub fn channels(&self, server_id: ServerId) -> Option<Vec<ChannelSummary>> {
        self.read()
            .channels
            .get(&server_id)
            .map(|channels| channels.values().cloned().collect())
    }

    pub fn members(&self, server_id: ServerId) -> Option<Vec<MemberSummary>> {
        self.read()
            .rosters
            .get(&server_id)
            .map(|roster| roster.members().cloned().collect())
    }

    pub fn bans(&self, server_id: ServerId) -> Option<Vec<BanSummary>> {
        let state = self.read();
        match state.rosters.get(&server_id) {
            Some(roster) => Some(roster.bans().cloned().collect()),
            None => state.unattached_bans.get(&server_id).cloned(),
        }
    }

    pub fn roster(&self, server_id: ServerId) -> Option<ServerRoster> {
        self.read().rosters.get(&server_id).cloned()
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.read().conversations.iter().cloned().collect()
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationSummary> {
        self.read().conversations.get(conversation_id).cloned()
    }

    pub fn conversation_with(&self, a: UserId, b: UserId) -> Option<ConversationSummary> {
        self.read().conversations.find(a, b).cloned()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.read().presence.contains(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.read().presence.iter().copied().collect()
    }

    // Message streams.

    pub fn stream_state(&self, stream: StreamKey) -> Option<StreamState> {
        self.read().streams.get(&stream).map(|entry| entry.state)
    }

    /// Messages in `(created_at, id)` order, or `None` if the stream is not open.
    pub fn messages(&self, stream: StreamKey) -> Option<Vec<CachedMessage>> {
        self.read().streams.get(&stream).map(MessageStream::snapshot)
    }

    pub fn message(&self, stream: StreamKey, message_id: MessageId) -> Option<CachedMessage> {
        self.read()
            .streams
            .get(&stream)
            .and_then(|entry| entry.get(message_id).cloned())
    }

    /// Starts (or restarts) the initial fetch of a stream. Pushes for it are
    /// buffered until [`EntityCache::complete_stream`].
    pub fn begin_stream(&self, stream: StreamKey) {
        self.write(|state, _| {
            state
                .streams
                .entry(stream)
                .and_modify(|entry| entry.state = StreamState::Loading)
                .or_insert_with(MessageStream::loading);
        });
    }

    /// Installs the fetched page, keeps unconfirmed local messages, then
    /// replays what was buffered while loading.
    pub fn complete_stream(&self, stream: StreamKey, fetched: Vec<MessagePayload>) {
        self.install_page(stream, fetched, |_| true);
    }

    /// Marks every loaded query stale and sends every open stream back to
    /// loading, after pushes may have been missed. Returns the streams to
    /// refetch.
    pub fn begin_resync(&self) -> Vec<StreamKey> {
        let streams = self.write(|state, events| {
            let keys: Vec<QueryKey> = state.queries.keys().copied().collect();
            for key in keys {
                state.invalidate(key, events);
            }
            state
                .streams
                .iter_mut()
                .filter(|(_, entry)| entry.state == StreamState::Open)
                .map(|(key, entry)| {
                    entry.state = StreamState::Loading;
                    *key
                })
                .collect::<Vec<_>>()
        });
        info!(streams = streams.len(), "cache: resynchronising after reconnect");
        streams
    }

    /// Like [`EntityCache::complete_stream`], but a pending message that is
    /// neither in the fetched page nor in `in_flight` is dropped: its send
    /// was lost. Returns the dropped ids.
    pub fn complete_resync(
        &self,
        stream: StreamKey,
        fetched: Vec<MessagePayload>,
        in_flight: &HashSet<MessageId>,
    ) -> Vec<MessageId> {
        self.install_page(stream, fetched, |id| in_flight.contains(&id))
    }

    fn install_page(
        &self,
        stream: StreamKey,
        fetched: Vec<MessagePayload>,
        keep_pending: impl Fn(MessageId) -> bool,
    ) -> Vec<MessageId> {
        let (replayed, dropped) = self.write(|state, events| {
            let entry = state
                .streams
                .entry(stream)
                .or_insert_with(MessageStream::loading);
            let pending: Vec<MessagePayload> = entry
                .ordered
                .values()
                .filter(|cached| cached.pending)
                .map(|cached| cached.message.clone())
                .collect();
            entry.ordered.clear();
            entry.index.clear();
            for message in fetched {
                if StreamKey::from(message.scope) == stream {
                    entry.upsert(message, true, false);
                }
            }
            let mut dropped = Vec::new();
            for message in pending {
                let message_id = message.message_id;
                if entry.get(message_id).is_some() {
                    continue;
                }
                let confirmed_later = entry.buffered.iter().any(
                    |op| matches!(op, StreamOp::Created(buffered) if buffered.message_id == message_id),
                );
                if confirmed_later || keep_pending(message_id) {
                    entry.upsert(message, true, true);
                } else {
                    dropped.push(message_id);
                    events.push(CacheEvent::MessageRemoved { stream, message_id });
                }
            }
            let buffered = std::mem::take(&mut entry.buffered);
            let replayed = buffered.len();
            for op in buffered {
                entry.apply(op);
            }
            entry.state = StreamState::Open;
            events.push(CacheEvent::StreamOpened(stream));
            (replayed, dropped)
        });
        debug!(stream = ?stream, replayed, dropped = dropped.len(), "cache: stream opened");
        dropped
    }

    /// Forgets a stream after its fetch failed or the view closed.
    pub fn close_stream(&self, stream: StreamKey) {
        self.write(|state, _| {
            state.streams.remove(&stream);
        });
    }

    /// Adds a locally created message ahead of confirmation. Returns `false`
    /// when the stream is not open.
    pub fn insert_optimistic(&self, message: MessagePayload) -> bool {
        let stream = StreamKey::from(message.scope);
        let message_id = message.message_id;
        self.write(|state, events| {
            let Some(entry) = state.streams.get_mut(&stream) else {
                return false;
            };
            let inserted = entry.upsert(message, true, true);
            if inserted {
                events.push(CacheEvent::MessageUpserted { stream, message_id });
            }
            inserted
        })
    }

    /// Applies the server's copy of a message this client created or edited.
    pub fn confirm_message(&self, message: MessagePayload) -> bool {
        let stream = StreamKey::from(message.scope);
        let message_id = message.message_id;
        self.write(|state, events| {
            let Some(entry) = state.streams.get_mut(&stream) else {
                return false;
            };
            if entry.state == StreamState::Loading {
                entry.buffered.push(StreamOp::Created(message));
                return true;
            }
            let applied = entry.upsert(message, true, false);
            if applied {
                events.push(CacheEvent::MessageUpserted { stream, message_id });
            }
            applied
        })
    }

    /// Removes an optimistic message whose creation was refused. A copy
    /// already confirmed stays.
    pub fn rollback_message(&self, stream: StreamKey, message_id: MessageId) -> bool {
        self.write(|state, events| {
            let Some(entry) = state.streams.get_mut(&stream) else {
                return false;
            };
            if !entry.get(message_id).is_some_and(|cached| cached.pending) {
                return false;
            }
            entry.take(message_id);
            events.push(CacheEvent::MessageRemoved { stream, message_id });
            true
        })
    }

    /// Applies an edit locally and returns the previous copy for rollback.
    pub fn apply_local_edit(
        &self,
        stream: StreamKey,
        message_id: MessageId,
        content: &str,
    ) -> Option<CachedMessage> {
        self.write(|state, events| {
            let entry = state.streams.get_mut(&stream)?;
            let created_at = *entry.index.get(&message_id)?;
            let cached = entry.ordered.get_mut(&(created_at, message_id))?;
            let previous = cached.clone();
            cached.message.content = content.to_string();
            cached.message.edited = true;
            events.push(CacheEvent::MessageUpserted { stream, message_id });
            Some(previous)
        })
    }

    /// Removes a message locally and returns it for rollback.
    pub fn apply_local_delete(&self, stream: StreamKey, message_id: MessageId) -> Option<CachedMessage> {
        self.write(|state, events| {
            let removed = state.streams.get_mut(&stream)?.take(message_id)?;
            events.push(CacheEvent::MessageRemoved { stream, message_id });
            Some(removed)
        })
    }

    /// Puts back a message copy, pending flag included, after a failed
    /// local edit or delete.
    pub fn restore_message(&self, previous: CachedMessage) {
        let stream = StreamKey::from(previous.message.scope);
        let message_id = previous.message.message_id;
        self.write(|state, events| {
            let Some(entry) = state.streams.get_mut(&stream) else {
                return;
            };
            entry.take(message_id);
            entry.index.insert(message_id, previous.message.created_at);
            entry
                .ordered
                .insert((previous.message.created_at, message_id), previous);
            events.push(CacheEvent::MessageUpserted { stream, message_id });
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<T>(&self, f: impl FnOnce(&mut CacheState, &mut Vec<CacheEvent>) -> T) -> T {
        let mut events = Vec::new();
        let result = {
            let mut guard: RwLockWriteGuard<'_, CacheState> =
                self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard, &mut events)
        };
        for event in events {
            let _ = self.events.send(event);
        }
        result
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
