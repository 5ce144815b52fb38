use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use chrono::Utc;
use shared::{
    domain::{
        ChannelId, ChannelKind, ConversationId, MessageId, MessageKind, Role, ServerId, UserId,
    },
    protocol::{
        AckResult, BanSummary, ChannelSummary, ConversationSummary, CreateMessageRequest,
        InviteSummary, LiveRequest, MemberSummary, MessagePayload, MessageScope, PushEvent,
        SendPrivateMessageRequest, ServerSummary, UserProfile,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod memory;
pub mod refresh;
pub mod registry;
pub mod session;
pub mod transport;

pub use api::{CrudApi, HttpCrudApi};
pub use cache::{
    CacheEffect, CacheEvent, CachedMessage, EntityCache, QueryKey, QueryState, StreamKey,
    StreamState,
};
pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, ClientResult};
pub use refresh::{
    CredentialRefresher, HttpCredentialRefresher, MissingCredentialRefresher, RefreshCoordinator,
    RefreshEvent,
};
pub use registry::{EventHandler, SubscriptionId, SubscriptionRegistry, Topic, TopicScope};
pub use session::{
    Credential, FileSessionStore, MemorySessionStore, Session, SessionHandle, SessionStore,
};
pub use transport::{
    ConnectionHandle, ConnectionStatus, DisconnectReason, LiveConnector, MissingLiveConnector,
    Transport, TransportSettings, TransportSignal, WsConnector,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        connection_id: u64,
    },
    Disconnected {
        connection_id: u64,
        reason: DisconnectReason,
    },
    ReconnectGaveUp {
        attempts: u32,
    },
    CredentialRenewed,
    /// Terminal: the credential could not be renewed and local state is gone.
    SessionEnded {
        reason: ClientError,
    },
    /// The local user was removed from a server (left, kicked, banned or the
    /// server was deleted). Its subscriptions have been cancelled.
    LeftServer {
        server_id: ServerId,
    },
    /// An optimistic message was refused and removed from the cache.
    MessageRejected {
        stream: StreamKey,
        message_id: MessageId,
        reason: String,
    },
}

/// Collaborators of a [`RealtimeClient`]. Tests swap in fakes.
pub struct ClientDependencies {
    pub connector: Arc<dyn LiveConnector>,
    pub refresher: Arc<dyn CredentialRefresher>,
    pub api: Arc<dyn CrudApi>,
    pub store: Arc<dyn SessionStore>,
    pub transport: TransportSettings,
}

impl ClientDependencies {
    pub fn from_settings(settings: &ClientSettings) -> ClientResult<Self> {
        settings.validate()?;
        let store: Arc<dyn SessionStore> = match &settings.session_file {
            Some(path) => Arc::new(FileSessionStore::new(path.clone())),
            None => Arc::new(MemorySessionStore::new()),
        };
        Ok(Self {
            connector: Arc::new(WsConnector::from_settings(settings)),
            refresher: Arc::new(HttpCredentialRefresher::from_settings(settings)),
            api: Arc::new(HttpCrudApi::from_settings(settings)),
            store,
            transport: TransportSettings::from(settings),
        })
    }
}

/// A live request whose outcome is still owed to the cache.
#[derive(Debug, Clone, Copy)]
struct OutstandingSend {
    stream: StreamKey,
    message_id: MessageId,
}

type Outstanding = Arc<Mutex<HashMap<u64, OutstandingSend>>>;

/// CRUD access with the session credential, renewed once on `AuthRejected`.
#[derive(Clone)]
struct Crud {
    api: Arc<dyn CrudApi>,
    session: Arc<SessionHandle>,
    refresh: Arc<RefreshCoordinator>,
}

impl Crud {
    async fn call<T, F, Fut>(&self, op: F) -> ClientResult<T>
    where
        F: Fn(Arc<dyn CrudApi>, Credential) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let credential = self.session.credential()?;
        match op(self.api.clone(), credential).await {
            Err(ClientError::AuthRejected) => {
                info!("client: request rejected, renewing credential before retry");
                let renewed = self.refresh.handle_auth_failure().await?;
                op(self.api.clone(), renewed).await
            }
            other => other,
        }
    }
}

/// One signed-in user's realtime session: live connection, credential
/// renewal, subscriptions and the local entity cache.
pub struct RealtimeClient {
    session: Arc<SessionHandle>,
    transport: Arc<Transport>,
    refresh: Arc<RefreshCoordinator>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<EntityCache>,
    crud: Crud,
    outstanding: Outstanding,
    /// Set once the session has been connected; a later `Connected` means
    /// pushes may have been missed.
    was_connected: Arc<AtomicBool>,
    events: broadcast::Sender<ClientEvent>,
    dispatcher: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl RealtimeClient {
    /// Must be called from within a tokio runtime: the dispatcher and
    /// supervisor tasks start immediately.
    pub fn new(deps: ClientDependencies) -> Arc<Self> {
        let session = Arc::new(SessionHandle::new(deps.store));
        let (transport, pushes) = Transport::new(deps.connector, deps.transport);
        let refresh = RefreshCoordinator::new(deps.refresher, session.clone(), transport.clone());
        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(EntityCache::new());
        let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));
        let was_connected = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(256);
        let crud = Crud {
            api: deps.api,
            session: session.clone(),
            refresh: refresh.clone(),
        };

        let dispatcher = tokio::spawn(run_dispatcher(
            pushes,
            cache.clone(),
            registry.clone(),
            events.clone(),
        ));
        let supervisor = tokio::spawn(run_supervisor(Supervisor {
            signals: transport.subscribe_signals(),
            refresh_events: refresh.subscribe(),
            refresh: refresh.clone(),
            crud: crud.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            outstanding: outstanding.clone(),
            was_connected: was_connected.clone(),
            events: events.clone(),
        }));

        Arc::new(Self {
            session,
            transport,
            refresh,
            registry,
            cache,
            crud,
            outstanding,
            was_connected,
            events,
            dispatcher,
            supervisor,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn user_id(&self) -> ClientResult<UserId> {
        self.session.user_id()
    }

    pub fn refresh_attempts(&self) -> u64 {
        self.refresh.attempts()
    }

    // Session lifecycle.

    /// Starts a session with an already issued credential.
    pub async fn login(&self, credential: Credential) -> ClientResult<UserProfile> {
        let profile = self.crud.api.profile(&credential).await?;
        self.transport.disconnect();
        self.reset_local_state();
        self.session
            .begin(Session {
                credential,
                user_id: profile.user_id,
            })
            .await?;
        self.cache.set_local_user(Some(profile.user_id));
        info!(user_id = %profile.user_id, "client: signed in");
        Ok(profile)
    }

    /// Picks up the session persisted by an earlier run, if there is one.
    pub async fn restore_session(&self) -> ClientResult<Option<UserId>> {
        let Some(session) = self.session.restore().await? else {
            return Ok(None);
        };
        self.reset_local_state();
        self.cache.set_local_user(Some(session.user_id));
        Ok(Some(session.user_id))
    }

    pub async fn logout(&self) -> ClientResult<()> {
        self.transport.disconnect();
        self.reset_local_state();
        self.session.clear().await?;
        info!("client: signed out");
        Ok(())
    }

    /// Opens the live connection. A rejected credential is renewed once
    /// before giving up.
    pub async fn connect(&self) -> ClientResult<ConnectionHandle> {
        let credential = self.session.credential()?;
        match self.transport.connect(credential).await {
            Err(ClientError::AuthRejected) => {
                info!("client: live handshake rejected, renewing credential");
                let renewed = self.refresh.handle_auth_failure().await?;
                self.transport.connect(renewed).await
            }
            other => other,
        }
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    // Subscriptions.

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    // Live requests.

    /// Sends a channel message. The message shows up in the cache at once
    /// and is confirmed by the acknowledgement or the echo, whichever
    /// lands first.
    pub async fn send_channel_message(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        content: &str,
        kind: MessageKind,
    ) -> ClientResult<MessagePayload> {
        let message = self.draft(
            MessageScope::Channel {
                server_id,
                channel_id,
            },
            content,
            kind,
        )?;
        let request = LiveRequest::CreateMessage(CreateMessageRequest {
            message_id: message.message_id,
            server_id,
            channel_id,
            content: message.content.clone(),
            kind,
        });
        self.send_optimistic(message, request).await
    }

    pub async fn send_private_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> ClientResult<MessagePayload> {
        let message = self.draft(
            MessageScope::Conversation { conversation_id },
            content,
            kind,
        )?;
        let request = LiveRequest::SendPrivateMessage(SendPrivateMessageRequest {
            message_id: message.message_id,
            conversation_id,
            content: message.content.clone(),
            kind,
        });
        self.send_optimistic(message, request).await
    }

    /// Asks the live connection for the servers the user belongs to.
    pub async fn find_all_servers(&self) -> ClientResult<Vec<ServerSummary>> {
        self.cache.begin_load(QueryKey::ServerList);
        let servers = match self.transport.request(&LiveRequest::FindAllServers).await {
            Ok(value) => {
                serde_json::from_value::<Vec<ServerSummary>>(value).map_err(ClientError::from)
            }
            Err(err) => Err(err),
        };
        match servers {
            Ok(servers) => {
                self.cache.load_servers(servers.clone());
                Ok(servers)
            }
            Err(err) => {
                self.cache.fail_load(QueryKey::ServerList);
                Err(err)
            }
        }
    }

    fn draft(
        &self,
        scope: MessageScope,
        content: &str,
        kind: MessageKind,
    ) -> ClientResult<MessagePayload> {
        let now = Utc::now();
        Ok(MessagePayload {
            message_id: MessageId::new(),
            author_id: self.session.user_id()?,
            content: content.to_string(),
            kind,
            created_at: now,
            updated_at: now,
            edited: false,
            scope,
        })
    }

    /// The request runs on its own task so the cache is settled even when
    /// the caller stops waiting.
    async fn send_optimistic(
        &self,
        message: MessagePayload,
        request: LiveRequest,
    ) -> ClientResult<MessagePayload> {
        let payload = request.payload()?;
        let stream = StreamKey::from(message.scope);
        let message_id = message.message_id;
        if !self.cache.insert_optimistic(message.clone()) {
            debug!(stream = ?stream, "client: stream not open, sending without local copy");
        }

        let request_id = self.transport.allocate_request_id();
        lock(&self.outstanding).insert(request_id, OutstandingSend { stream, message_id });

        let transport = self.transport.clone();
        let cache = self.cache.clone();
        let outstanding = self.outstanding.clone();
        let events = self.events.clone();
        let event = request.event_name();
        let task = tokio::spawn(async move {
            let result = transport.send_with_id(request_id, event, payload).await;
            match result {
                Ok(value) => {
                    lock(&outstanding).remove(&request_id);
                    let stored = serde_json::from_value::<MessagePayload>(value)
                        .ok()
                        .filter(|stored| stored.message_id == message_id)
                        .unwrap_or(message);
                    cache.confirm_message(stored.clone());
                    Ok(stored)
                }
                Err(ClientError::Timeout(ms)) => {
                    warn!(request_id, %message_id, "client: send timed out, keeping local copy");
                    Err(ClientError::Timeout(ms))
                }
                Err(err) => {
                    lock(&outstanding).remove(&request_id);
                    reject_message(&cache, &events, stream, message_id, err.to_string());
                    Err(err)
                }
            }
        });
        task.await
            .map_err(|err| ClientError::Protocol(format!("send task failed: {err}")))?
    }

    // Message mutations.

    pub async fn edit_message(
        &self,
        stream: StreamKey,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        let scope = MessageScope::from(stream);
        let previous = self.cache.apply_local_edit(stream, message_id, content);
        let result = self
            .call(|api, credential| async move {
                api.edit_message(&credential, scope, message_id, content)
                    .await
            })
            .await;
        match result {
            Ok(stored) => {
                self.cache.confirm_message(stored.clone());
                Ok(stored)
            }
            Err(err) => {
                if err.is_not_found() {
                    self.cache.apply_local_delete(stream, message_id);
                } else if let Some(previous) = previous {
                    self.cache.restore_message(previous);
                }
                Err(err)
            }
        }
    }

    pub async fn delete_message(&self, stream: StreamKey, message_id: MessageId) -> ClientResult<()> {
        let scope = MessageScope::from(stream);
        let removed = self.cache.apply_local_delete(stream, message_id);
        let result = self
            .call(|api, credential| async move {
                api.delete_message(&credential, scope, message_id).await
            })
            .await;
        match result {
            Err(err) if !err.is_not_found() => {
                if let Some(removed) = removed {
                    self.cache.restore_message(removed);
                }
                Err(err)
            }
            _ => Ok(()),
        }
    }

    // Queries.

    /// Loads a channel's history and starts tracking its pushes.
    pub async fn open_channel(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> ClientResult<Vec<CachedMessage>> {
        self.open_stream(StreamKey::Channel {
            server_id,
            channel_id,
        })
        .await
    }

    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> ClientResult<Vec<CachedMessage>> {
        self.open_stream(StreamKey::Conversation(conversation_id))
            .await
    }

    pub fn close_stream(&self, stream: StreamKey) {
        self.cache.close_stream(stream);
    }

    async fn open_stream(&self, stream: StreamKey) -> ClientResult<Vec<CachedMessage>> {
        let scope = MessageScope::from(stream);
        self.cache.begin_stream(stream);
        let fetched = self
            .call(|api, credential| async move { api.list_messages(&credential, scope).await })
            .await;
        match fetched {
            Ok(fetched) => {
                self.cache.complete_stream(stream, fetched);
                Ok(self.cache.messages(stream).unwrap_or_default())
            }
            Err(err) => {
                self.cache.close_stream(stream);
                Err(err)
            }
        }
    }

    /// Refetches a list query and installs the result.
    pub async fn refresh_query(&self, key: QueryKey) -> ClientResult<()> {
        self.cache.begin_load(key);
        let result = self.load_query(key).await;
        if let Err(err) = &result {
            warn!(query = ?key, "client: query refetch failed: {err}");
            self.cache.fail_load(key);
        }
        result
    }

    /// Refetches every query currently marked stale.
    pub async fn refresh_stale(&self) -> ClientResult<usize> {
        let stale = self.cache.stale_queries();
        for key in &stale {
            self.refresh_query(*key).await?;
        }
        Ok(stale.len())
    }

    async fn load_query(&self, key: QueryKey) -> ClientResult<()> {
        match key {
            QueryKey::ServerList => {
                let servers = self
                    .call(|api, credential| async move { api.list_servers(&credential).await })
                    .await?;
                self.cache.load_servers(servers);
            }
            QueryKey::ChannelList(server_id) => {
                let channels = self
                    .call(|api, credential| async move {
                        api.list_channels(&credential, server_id).await
                    })
                    .await?;
                self.cache.load_channels(server_id, channels);
            }
            QueryKey::MemberList(server_id) => {
                let members = self
                    .call(|api, credential| async move {
                        api.list_members(&credential, server_id).await
                    })
                    .await?;
                self.cache.load_members(server_id, members)?;
            }
            QueryKey::BanList(server_id) => {
                let bans = self
                    .call(|api, credential| async move { api.list_bans(&credential, server_id).await })
                    .await?;
                self.cache.load_bans(server_id, bans);
            }
            QueryKey::ConversationList => {
                let conversations = self
                    .call(|api, credential| async move { api.list_conversations(&credential).await })
                    .await?;
                self.cache.load_conversations(conversations);
            }
        }
        Ok(())
    }

    // Structural mutations. Each invalidates the lists it affects; the
    // refetch is left to the caller.

    pub async fn create_server(&self, name: &str) -> ClientResult<ServerSummary> {
        self.mutate(&[QueryKey::ServerList], |api, credential| async move {
            api.create_server(&credential, name).await
        })
        .await
    }

    pub async fn update_server(&self, server_id: ServerId, name: &str) -> ClientResult<ServerSummary> {
        self.mutate(&[QueryKey::ServerList], |api, credential| async move {
            api.update_server(&credential, server_id, name).await
        })
        .await
    }

    pub async fn delete_server(&self, server_id: ServerId) -> ClientResult<()> {
        let result = self
            .call(|api, credential| async move { api.delete_server(&credential, server_id).await })
            .await;
        self.settle_departure(server_id, result)
    }

    pub async fn leave_server(&self, server_id: ServerId) -> ClientResult<()> {
        let result = self
            .call(|api, credential| async move { api.leave_server(&credential, server_id).await })
            .await;
        self.settle_departure(server_id, result)
    }

    pub async fn create_channel(
        &self,
        server_id: ServerId,
        name: &str,
        kind: ChannelKind,
    ) -> ClientResult<ChannelSummary> {
        self.mutate(&[QueryKey::ChannelList(server_id)], |api, credential| async move {
            api.create_channel(&credential, server_id, name, kind).await
        })
        .await
    }

    pub async fn update_channel(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        name: &str,
    ) -> ClientResult<ChannelSummary> {
        self.mutate(&[QueryKey::ChannelList(server_id)], |api, credential| async move {
            api.update_channel(&credential, server_id, channel_id, name)
                .await
        })
        .await
    }

    pub async fn delete_channel(&self, server_id: ServerId, channel_id: ChannelId) -> ClientResult<()> {
        let result = self
            .mutate(&[QueryKey::ChannelList(server_id)], |api, credential| async move {
                api.delete_channel(&credential, server_id, channel_id).await
            })
            .await;
        if result.is_ok() || result.as_ref().is_err_and(ClientError::is_not_found) {
            self.cache.close_stream(StreamKey::Channel {
                server_id,
                channel_id,
            });
        }
        result
    }

    pub async fn change_role(
        &self,
        server_id: ServerId,
        user_id: UserId,
        role: Role,
    ) -> ClientResult<MemberSummary> {
        self.mutate(&[QueryKey::MemberList(server_id)], |api, credential| async move {
            api.change_role(&credential, server_id, user_id, role).await
        })
        .await
    }

    pub async fn kick_member(&self, server_id: ServerId, user_id: UserId) -> ClientResult<()> {
        self.mutate(&[QueryKey::MemberList(server_id)], |api, credential| async move {
            api.kick_member(&credential, server_id, user_id).await
        })
        .await
    }

    /// Hands the server to `new_owner_id`. The local roster swaps both roles
    /// in one step once the server accepts.
    pub async fn transfer_ownership(&self, server_id: ServerId, new_owner_id: UserId) -> ClientResult<()> {
        let previous_owner = self.session.user_id()?;
        self.mutate(
            &[QueryKey::ServerList, QueryKey::MemberList(server_id)],
            |api, credential| async move {
                api.transfer_ownership(&credential, server_id, new_owner_id)
                    .await
            },
        )
        .await?;
        self.cache
            .apply_ownership_change(server_id, previous_owner, new_owner_id);
        Ok(())
    }

    pub async fn ban_member(
        &self,
        server_id: ServerId,
        user_id: UserId,
        reason: Option<&str>,
    ) -> ClientResult<BanSummary> {
        self.mutate(
            &[QueryKey::MemberList(server_id), QueryKey::BanList(server_id)],
            |api, credential| async move {
                api.ban_member(&credential, server_id, user_id, reason).await
            },
        )
        .await
    }

    pub async fn unban_member(&self, server_id: ServerId, user_id: UserId) -> ClientResult<()> {
        self.mutate(&[QueryKey::BanList(server_id)], |api, credential| async move {
            api.unban_member(&credential, server_id, user_id).await
        })
        .await
    }

    pub async fn create_invitation(
        &self,
        server_id: ServerId,
        max_uses: Option<u32>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> ClientResult<InviteSummary> {
        self.call(|api, credential| async move {
            api.create_invitation(&credential, server_id, max_uses, expires_at)
                .await
        })
        .await
    }

    pub async fn join_with_invitation(&self, code: &str) -> ClientResult<ServerSummary> {
        self.mutate(&[QueryKey::ServerList], |api, credential| async move {
            api.join_with_invitation(&credential, code).await
        })
        .await
    }

    /// Opens (or finds) the one-to-one conversation with `other_user`.
    pub async fn start_conversation(&self, other_user: UserId) -> ClientResult<ConversationSummary> {
        if other_user == self.session.user_id()? {
            return Err(ClientError::Validation(
                "cannot open a conversation with yourself".into(),
            ));
        }
        let conversation = self
            .call(|api, credential| async move {
                api.open_conversation(&credential, other_user).await
            })
            .await?;
        if let Err(err) = self.cache.insert_conversation(conversation.clone()) {
            warn!(
                conversation_id = %conversation.conversation_id,
                "client: conversation conflicts with cached copy: {err}"
            );
            self.cache.invalidate(QueryKey::ConversationList);
        }
        Ok(conversation)
    }

    async fn call<T, F, Fut>(&self, op: F) -> ClientResult<T>
    where
        F: Fn(Arc<dyn CrudApi>, Credential) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        self.crud.call(op).await
    }

    /// A `NotFound` means the local copy is out of date, so it invalidates too.
    async fn mutate<T, F, Fut>(&self, affected: &[QueryKey], op: F) -> ClientResult<T>
    where
        F: Fn(Arc<dyn CrudApi>, Credential) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let result = self.call(op).await;
        if result.is_ok() || result.as_ref().is_err_and(ClientError::is_not_found) {
            for key in affected {
                self.cache.invalidate(*key);
            }
        }
        result
    }

    fn settle_departure(&self, server_id: ServerId, result: ClientResult<()>) -> ClientResult<()> {
        if result.is_ok() || result.as_ref().is_err_and(ClientError::is_not_found) {
            let channels = self.cache.remove_server(server_id);
            let cancelled = self.registry.unsubscribe_server_scope(server_id, &channels);
            info!(%server_id, cancelled, "client: left server");
        }
        result
    }

    fn reset_local_state(&self) {
        self.cache.clear();
        self.registry.clear();
        lock(&self.outstanding).clear();
        self.was_connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.transport.disconnect();
        self.dispatcher.abort();
        self.supervisor.abort();
    }
}

fn lock(outstanding: &Outstanding) -> std::sync::MutexGuard<'_, HashMap<u64, OutstandingSend>> {
    outstanding.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject_message(
    cache: &EntityCache,
    events: &broadcast::Sender<ClientEvent>,
    stream: StreamKey,
    message_id: MessageId,
    reason: String,
) {
    if cache.rollback_message(stream, message_id) {
        warn!(%message_id, "client: message rejected, rolled back: {reason}");
        let _ = events.send(ClientEvent::MessageRejected {
            stream,
            message_id,
            reason,
        });
    }
}

/// Applies pushes to the cache and then hands them to subscribers, one at a
/// time in arrival order.
async fn run_dispatcher(
    mut pushes: mpsc::UnboundedReceiver<PushEvent>,
    cache: Arc<EntityCache>,
    registry: Arc<SubscriptionRegistry>,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(event) = pushes.recv().await {
        let effect = cache.apply_push(&event);
        let delivered = registry.dispatch(&event);
        debug!(event = event.name(), ?effect, delivered, "client: push dispatched");
        if let CacheEffect::LeftServer {
            server_id,
            channels,
        } = effect
        {
            let cancelled = registry.unsubscribe_server_scope(server_id, &channels);
            info!(%server_id, cancelled, "client: removed from server");
            let _ = events.send(ClientEvent::LeftServer { server_id });
        }
    }
    debug!("client: push stream closed");
}

struct Supervisor {
    signals: broadcast::Receiver<TransportSignal>,
    refresh_events: broadcast::Receiver<RefreshEvent>,
    refresh: Arc<RefreshCoordinator>,
    crud: Crud,
    cache: Arc<EntityCache>,
    registry: Arc<SubscriptionRegistry>,
    outstanding: Outstanding,
    was_connected: Arc<AtomicBool>,
    events: broadcast::Sender<ClientEvent>,
}

/// Reacts to transport and refresh signals for the lifetime of the client.
async fn run_supervisor(mut sv: Supervisor) {
    loop {
        tokio::select! {
            signal = sv.signals.recv() => match signal {
                Ok(signal) => sv.on_transport_signal(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client: transport signals lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = sv.refresh_events.recv() => match event {
                Ok(event) => sv.on_refresh_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client: refresh events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

impl Supervisor {
    fn on_transport_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected { connection_id } => {
                if self.was_connected.swap(true, Ordering::SeqCst) {
                    self.resync();
                }
                let _ = self.events.send(ClientEvent::Connected { connection_id });
            }
            TransportSignal::Disconnected {
                connection_id,
                reason,
            } => {
                let _ = self.events.send(ClientEvent::Disconnected {
                    connection_id,
                    reason,
                });
            }
            TransportSignal::AuthError => {
                let refresh = self.refresh.clone();
                tokio::spawn(async move {
                    if let Err(err) = refresh.handle_auth_failure().await {
                        debug!("client: background credential renewal failed: {err}");
                    }
                });
            }
            TransportSignal::LateAck {
                request_id,
                event,
                result,
            } => self.on_late_ack(request_id, &event, result),
            TransportSignal::ReconnectGaveUp { attempts } => {
                let _ = self.events.send(ClientEvent::ReconnectGaveUp { attempts });
            }
            TransportSignal::OrphansDropped { request_ids } => {
                // The copies stay pending until the next resync settles them.
                let mut outstanding = lock(&self.outstanding);
                for request_id in &request_ids {
                    outstanding.remove(request_id);
                }
                debug!(count = request_ids.len(), "client: unacknowledged sends lost with the link");
            }
        }
    }

    /// Pushes sent while the link was down are gone: lists go stale and
    /// open streams are refetched, with newer pushes buffered meanwhile.
    fn resync(&self) {
        let streams = self.cache.begin_resync();
        if streams.is_empty() {
            return;
        }
        let crud = self.crud.clone();
        let cache = self.cache.clone();
        let outstanding = self.outstanding.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            for stream in streams {
                let scope = MessageScope::from(stream);
                let fetched = crud
                    .call(|api, credential| async move { api.list_messages(&credential, scope).await })
                    .await;
                let fetched = match fetched {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(stream = ?stream, "client: stream refetch failed, closing it: {err}");
                        cache.close_stream(stream);
                        continue;
                    }
                };
                let in_flight: HashSet<MessageId> = lock(&outstanding)
                    .values()
                    .filter(|send| send.stream == stream)
                    .map(|send| send.message_id)
                    .collect();
                for message_id in cache.complete_resync(stream, fetched, &in_flight) {
                    warn!(%message_id, "client: unconfirmed message lost with the connection");
                    let _ = events.send(ClientEvent::MessageRejected {
                        stream,
                        message_id,
                        reason: "lost with the connection".into(),
                    });
                }
            }
        });
    }

    fn on_late_ack(&self, request_id: u64, event: &str, result: AckResult) {
        let Some(send) = lock(&self.outstanding).remove(&request_id) else {
            debug!(request_id, event, "client: late acknowledgement for untracked request");
            return;
        };
        match result {
            AckResult::Ok(value) => {
                if let Ok(stored) = serde_json::from_value::<MessagePayload>(value) {
                    if stored.message_id == send.message_id {
                        self.cache.confirm_message(stored);
                    }
                }
                debug!(request_id, event, "client: late acknowledgement applied");
            }
            AckResult::Error(reason) => {
                reject_message(&self.cache, &self.events, send.stream, send.message_id, reason);
            }
        }
    }

    fn on_refresh_event(&self, event: RefreshEvent) {
        match event {
            RefreshEvent::Renewed { attempt } => {
                debug!(attempt, "client: credential renewed");
                let _ = self.events.send(ClientEvent::CredentialRenewed);
            }
            RefreshEvent::SessionEnded { reason } => {
                warn!("client: session ended: {reason}");
                self.cache.clear();
                self.registry.clear();
                lock(&self.outstanding).clear();
                self.was_connected.store(false, Ordering::SeqCst);
                let _ = self.events.send(ClientEvent::SessionEnded { reason });
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
