//! In-memory backend for end-to-end scenarios: answers CRUD calls, live
//! requests and refresh calls, and fans push events out to every attached
//! live link.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_core::{
    domain::{ConversationDirectory, ServerRoster},
    memory::{MemoryConnector, MemoryPeer},
    ClientDependencies, ClientError, ClientEvent, ClientResult, Credential, CredentialRefresher,
    CrudApi, MemorySessionStore, RealtimeClient, TransportSettings,
};
use serde_json::Value;
use shared::{
    domain::{
        ChannelId, ChannelKind, ConversationId, MessageId, MessageKind, Role, ServerId, UserId,
    },
    protocol::{
        requests, AckResult, BanSummary, ChannelSummary, ClientFrame, ConversationSummary,
        CreateMessageRequest, InviteSummary, MemberSummary, MessagePayload, MessageScope,
        PushEvent, SendPrivateMessageRequest, ServerSummary, UserProfile,
    },
};
use tokio::sync::{broadcast, mpsc};

enum LinkCommand {
    Push(PushEvent),
    Close { auth_expired: bool },
}

#[derive(Default)]
struct BackendState {
    tokens: HashMap<String, UserId>,
    expired: HashMap<String, UserId>,
    users: HashMap<UserId, String>,
    servers: HashMap<ServerId, ServerSummary>,
    rosters: HashMap<ServerId, ServerRoster>,
    channels: HashMap<ServerId, Vec<ChannelSummary>>,
    conversations: ConversationDirectory,
    messages: Vec<MessagePayload>,
    issued: u64,
    outbox: Vec<PushEvent>,
}

impl BackendState {
    fn user(&self, credential: &Credential) -> ClientResult<UserId> {
        self.tokens
            .get(credential.expose())
            .copied()
            .ok_or(ClientError::AuthRejected)
    }

    fn username(&self, user_id: UserId) -> String {
        self.users.get(&user_id).cloned().unwrap_or_default()
    }

    fn roster(&mut self, server_id: ServerId) -> ClientResult<&mut ServerRoster> {
        self.rosters
            .get_mut(&server_id)
            .ok_or_else(|| ClientError::NotFound(format!("server {server_id}")))
    }

    fn member_role(&mut self, server_id: ServerId, user_id: UserId) -> ClientResult<Role> {
        self.roster(server_id)?
            .role_of(user_id)
            .ok_or_else(|| ClientError::Forbidden("not a member of this server".into()))
    }

    fn require_admin(&mut self, server_id: ServerId, user_id: UserId) -> ClientResult<()> {
        if self.member_role(server_id, user_id)?.is_admin_tier() {
            Ok(())
        } else {
            Err(ClientError::Forbidden("admin rights required".into()))
        }
    }

    fn channel_mut(
        &mut self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> ClientResult<&mut ChannelSummary> {
        self.channels
            .get_mut(&server_id)
            .and_then(|channels| channels.iter_mut().find(|c| c.channel_id == channel_id))
            .ok_or_else(|| ClientError::NotFound(format!("channel {channel_id}")))
    }

    fn can_read(&mut self, user_id: UserId, scope: MessageScope) -> ClientResult<()> {
        match scope {
            MessageScope::Channel {
                server_id,
                channel_id,
            } => {
                self.member_role(server_id, user_id)?;
                self.channel_mut(server_id, channel_id).map(|_| ())
            }
            MessageScope::Conversation { conversation_id } => {
                let conversation = self
                    .conversations
                    .get(conversation_id)
                    .ok_or_else(|| ClientError::NotFound(format!("conversation {conversation_id}")))?;
                if conversation.involves(user_id) {
                    Ok(())
                } else {
                    Err(ClientError::Forbidden("not part of this conversation".into()))
                }
            }
        }
    }

    fn store_message(
        &mut self,
        author_id: UserId,
        scope: MessageScope,
        id: MessageId,
        content: String,
        kind: MessageKind,
    ) -> MessagePayload {
        let now = Utc::now();
        let message = MessagePayload {
            message_id: id,
            author_id,
            content,
            kind,
            created_at: now,
            updated_at: now,
            edited: false,
            scope,
        };
        self.messages.push(message.clone());
        message
    }
}

pub struct FakeBackend {
    state: Mutex<BackendState>,
    links: Mutex<Vec<mpsc::UnboundedSender<LinkCommand>>>,
    echo_delay: Duration,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::with_echo_delay(Duration::ZERO)
    }

    pub fn with_echo_delay(echo_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState::default()),
            links: Mutex::new(Vec::new()),
            echo_delay,
        })
    }

    pub fn register(&self, username: &str, token: &str) -> UserId {
        let user_id = UserId::new();
        let mut state = self.state.lock().expect("backend state");
        state.users.insert(user_id, username.to_string());
        state.tokens.insert(token.to_string(), user_id);
        user_id
    }

    /// The token stops working for requests but can still be refreshed.
    pub fn expire(&self, token: &str) {
        let mut state = self.state.lock().expect("backend state");
        if let Some(user_id) = state.tokens.remove(token) {
            state.expired.insert(token.to_string(), user_id);
        }
    }

    pub fn is_member(&self, server_id: ServerId, user_id: UserId) -> bool {
        let state = self.state.lock().expect("backend state");
        state
            .rosters
            .get(&server_id)
            .is_some_and(|roster| roster.member(user_id).is_some())
    }

    /// Serves one live link until it closes.
    pub fn attach(self: &Arc<Self>, mut peer: MemoryPeer) {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        self.links.lock().expect("links").push(commands);
        let backend = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = peer.next_frame() => match frame {
                        Some(ClientFrame::Request { request_id, event, payload }) => {
                            let result = backend.handle_live(&peer.credential, &event, payload);
                            peer.ack(request_id, result);
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(LinkCommand::Push(event)) => {
                            peer.push(&event);
                        }
                        Some(LinkCommand::Close { auth_expired }) => {
                            peer.close("closed by backend", auth_expired);
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Drops every live link, as a server restart would.
    pub fn close_links(&self, auth_expired: bool) {
        let mut links = self.links.lock().expect("links");
        for link in links.drain(..) {
            let _ = link.send(LinkCommand::Close { auth_expired });
        }
    }

    fn broadcast(&self, events: Vec<PushEvent>) {
        let mut links = self.links.lock().expect("links");
        for event in events {
            links.retain(|link| link.send(LinkCommand::Push(event.clone())).is_ok());
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut BackendState) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let (result, outbox) = {
            let mut state = self.state.lock().expect("backend state");
            let result = f(&mut state);
            (result, std::mem::take(&mut state.outbox))
        };
        self.broadcast(outbox);
        result
    }

    fn authed<T>(
        &self,
        credential: &Credential,
        f: impl FnOnce(&mut BackendState, UserId) -> ClientResult<T>,
    ) -> ClientResult<T> {
        self.with_state(|state| {
            let user_id = state.user(credential)?;
            f(state, user_id)
        })
    }

    fn echo_later(self: &Arc<Self>, event: PushEvent) {
        let backend = self.clone();
        let delay = self.echo_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            backend.broadcast(vec![event]);
        });
    }

    fn handle_live(self: &Arc<Self>, credential: &Credential, event: &str, payload: Value) -> AckResult {
        let outcome = match event {
            requests::CREATE_MESSAGE => self.create_message(credential, payload),
            requests::SEND_PRIVATE_MESSAGE => self.send_private(credential, payload),
            requests::FIND_ALL_SERVERS => self
                .servers_of(credential)
                .and_then(|servers| Ok(serde_json::to_value(servers)?)),
            other => Err(ClientError::Validation(format!("unknown request {other}"))),
        };
        match outcome {
            Ok(value) => AckResult::Ok(value),
            Err(err) => AckResult::Error(err.to_string()),
        }
    }

    fn create_message(self: &Arc<Self>, credential: &Credential, payload: Value) -> ClientResult<Value> {
        let request: CreateMessageRequest = serde_json::from_value(payload)?;
        let scope = MessageScope::Channel {
            server_id: request.server_id,
            channel_id: request.channel_id,
        };
        let message = self.authed(credential, |state, user_id| {
            state.can_read(user_id, scope)?;
            Ok(state.store_message(
                user_id,
                scope,
                request.message_id,
                request.content,
                request.kind,
            ))
        })?;
        self.echo_later(PushEvent::MessageCreated {
            message: message.clone(),
        });
        Ok(serde_json::to_value(message)?)
    }

    fn send_private(self: &Arc<Self>, credential: &Credential, payload: Value) -> ClientResult<Value> {
        let request: SendPrivateMessageRequest = serde_json::from_value(payload)?;
        let scope = MessageScope::Conversation {
            conversation_id: request.conversation_id,
        };
        let message = self.authed(credential, |state, user_id| {
            state.can_read(user_id, scope)?;
            Ok(state.store_message(
                user_id,
                scope,
                request.message_id,
                request.content,
                request.kind,
            ))
        })?;
        self.echo_later(PushEvent::PrivateMessageCreated {
            message: message.clone(),
        });
        Ok(serde_json::to_value(message)?)
    }

    fn servers_of(&self, credential: &Credential) -> ClientResult<Vec<ServerSummary>> {
        self.authed(credential, |state, user_id| {
            Ok(state
                .servers
                .values()
                .filter(|server| {
                    state
                        .rosters
                        .get(&server.server_id)
                        .is_some_and(|roster| roster.member(user_id).is_some())
                })
                .cloned()
                .collect())
        })
    }
}

#[async_trait]
impl CredentialRefresher for FakeBackend {
    async fn refresh(&self, current: &Credential) -> ClientResult<Credential> {
        let mut state = self.state.lock().expect("backend state");
        let user_id = state
            .tokens
            .get(current.expose())
            .or_else(|| state.expired.get(current.expose()))
            .copied()
            .ok_or_else(|| ClientError::RefreshDenied("unknown refresh token".into()))?;
        state.issued += 1;
        let token = format!("renewed-{}", state.issued);
        state.tokens.insert(token.clone(), user_id);
        Ok(Credential::new(token))
    }
}

#[async_trait]
impl CrudApi for FakeBackend {
    async fn profile(&self, credential: &Credential) -> ClientResult<UserProfile> {
        self.authed(credential, |state, user_id| {
            Ok(UserProfile {
                user_id,
                username: state.username(user_id),
                avatar_url: None,
            })
        })
    }

    async fn list_servers(&self, credential: &Credential) -> ClientResult<Vec<ServerSummary>> {
        self.servers_of(credential)
    }

    async fn create_server(&self, credential: &Credential, name: &str) -> ClientResult<ServerSummary> {
        self.authed(credential, |state, user_id| {
            let server = ServerSummary {
                server_id: ServerId::new(),
                name: name.to_string(),
                owner_id: user_id,
                image_url: None,
            };
            let roster = ServerRoster::new(server.server_id, user_id, state.username(user_id));
            state.rosters.insert(server.server_id, roster);
            state.servers.insert(server.server_id, server.clone());
            Ok(server)
        })
    }

    async fn update_server(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
    ) -> ClientResult<ServerSummary> {
        self.authed(credential, |state, user_id| {
            state.require_admin(server_id, user_id)?;
            let server = state
                .servers
                .get_mut(&server_id)
                .ok_or_else(|| ClientError::NotFound(format!("server {server_id}")))?;
            server.name = name.to_string();
            let server = server.clone();
            state.outbox.push(PushEvent::ServerUpdated {
                server: server.clone(),
            });
            Ok(server)
        })
    }

    async fn delete_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            if state.member_role(server_id, user_id)? != Role::Owner {
                return Err(ClientError::Forbidden("only the owner deletes a server".into()));
            }
            state.servers.remove(&server_id);
            state.rosters.remove(&server_id);
            state.channels.remove(&server_id);
            state.outbox.push(PushEvent::ServerDeleted { server_id });
            Ok(())
        })
    }

    async fn leave_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state.roster(server_id)?.remove_member(user_id, user_id)?;
            state
                .outbox
                .push(PushEvent::MemberLeft { server_id, user_id });
            Ok(())
        })
    }

    async fn list_channels(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<ChannelSummary>> {
        self.authed(credential, |state, user_id| {
            state.member_role(server_id, user_id)?;
            Ok(state.channels.get(&server_id).cloned().unwrap_or_default())
        })
    }

    async fn create_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
        kind: ChannelKind,
    ) -> ClientResult<ChannelSummary> {
        self.authed(credential, |state, user_id| {
            state.require_admin(server_id, user_id)?;
            let channel = ChannelSummary {
                channel_id: ChannelId::new(),
                server_id,
                name: name.to_string(),
                kind,
            };
            state
                .channels
                .entry(server_id)
                .or_default()
                .push(channel.clone());
            state.outbox.push(PushEvent::ChannelCreated {
                channel: channel.clone(),
            });
            Ok(channel)
        })
    }

    async fn update_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
        name: &str,
    ) -> ClientResult<ChannelSummary> {
        self.authed(credential, |state, user_id| {
            state.require_admin(server_id, user_id)?;
            let channel = state.channel_mut(server_id, channel_id)?;
            channel.name = name.to_string();
            let channel = channel.clone();
            state.outbox.push(PushEvent::ChannelUpdated {
                channel: channel.clone(),
            });
            Ok(channel)
        })
    }

    async fn delete_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state.require_admin(server_id, user_id)?;
            state.channel_mut(server_id, channel_id)?;
            if let Some(channels) = state.channels.get_mut(&server_id) {
                channels.retain(|channel| channel.channel_id != channel_id);
            }
            state.outbox.push(PushEvent::ChannelDeleted {
                server_id,
                channel_id,
            });
            Ok(())
        })
    }

    async fn list_members(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<MemberSummary>> {
        self.authed(credential, |state, user_id| {
            state.member_role(server_id, user_id)?;
            Ok(state.roster(server_id)?.members().cloned().collect())
        })
    }

    async fn change_role(
        &self,
        credential: &Credential,
        server_id: ServerId,
        target: UserId,
        role: Role,
    ) -> ClientResult<MemberSummary> {
        self.authed(credential, |state, user_id| {
            let roster = state.roster(server_id)?;
            roster.change_role(user_id, target, role)?;
            let member = roster
                .member(target)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(format!("member {target}")))?;
            state.outbox.push(PushEvent::MemberRoleChanged {
                server_id,
                user_id: target,
                role,
            });
            Ok(member)
        })
    }

    async fn kick_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        target: UserId,
    ) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state.roster(server_id)?.remove_member(user_id, target)?;
            state.outbox.push(PushEvent::MemberKicked {
                server_id,
                user_id: target,
            });
            Ok(())
        })
    }

    async fn transfer_ownership(
        &self,
        credential: &Credential,
        server_id: ServerId,
        new_owner_id: UserId,
    ) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state
                .roster(server_id)?
                .transfer_ownership(user_id, new_owner_id)?;
            if let Some(server) = state.servers.get_mut(&server_id) {
                server.owner_id = new_owner_id;
            }
            state.outbox.push(PushEvent::ServerOwnerChanged {
                server_id,
                previous_owner_id: user_id,
                new_owner_id,
            });
            Ok(())
        })
    }

    async fn list_bans(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<BanSummary>> {
        self.authed(credential, |state, user_id| {
            if !state.member_role(server_id, user_id)?.can_moderate() {
                return Err(ClientError::Forbidden("moderator rights required".into()));
            }
            Ok(state.roster(server_id)?.bans().cloned().collect())
        })
    }

    async fn ban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        target: UserId,
        reason: Option<&str>,
    ) -> ClientResult<BanSummary> {
        self.authed(credential, |state, user_id| {
            let ban = state.roster(server_id)?.ban(
                user_id,
                target,
                reason.map(str::to_string),
                Utc::now(),
            )?;
            state
                .outbox
                .push(PushEvent::MemberBanned { ban: ban.clone() });
            Ok(ban)
        })
    }

    async fn unban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        target: UserId,
    ) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state.roster(server_id)?.unban(user_id, target)?;
            state.outbox.push(PushEvent::MemberUnbanned {
                server_id,
                user_id: target,
            });
            Ok(())
        })
    }

    async fn create_invitation(
        &self,
        credential: &Credential,
        server_id: ServerId,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ClientResult<InviteSummary> {
        self.authed(credential, |state, user_id| {
            state.issued += 1;
            let code = format!("invite-{}", state.issued);
            Ok(state
                .roster(server_id)?
                .create_invitation(user_id, code, max_uses, expires_at)?)
        })
    }

    async fn join_with_invitation(
        &self,
        credential: &Credential,
        code: &str,
    ) -> ClientResult<ServerSummary> {
        self.authed(credential, |state, user_id| {
            let username = state.username(user_id);
            let roster = state
                .rosters
                .values_mut()
                .find(|roster| roster.invitation(code).is_some())
                .ok_or_else(|| ClientError::NotFound(format!("invitation {code}")))?;
            let member = roster
                .consume_invitation(code, user_id, username, Utc::now())?
                .clone();
            let server = state
                .servers
                .get(&member.server_id)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(format!("server {}", member.server_id)))?;
            state.outbox.push(PushEvent::MemberJoined { member });
            Ok(server)
        })
    }

    async fn list_conversations(
        &self,
        credential: &Credential,
    ) -> ClientResult<Vec<ConversationSummary>> {
        self.authed(credential, |state, user_id| {
            Ok(state
                .conversations
                .iter()
                .filter(|conversation| conversation.involves(user_id))
                .cloned()
                .collect())
        })
    }

    async fn open_conversation(
        &self,
        credential: &Credential,
        other_user: UserId,
    ) -> ClientResult<ConversationSummary> {
        self.authed(credential, |state, user_id| {
            if !state.users.contains_key(&other_user) {
                return Err(ClientError::NotFound(format!("user {other_user}")));
            }
            let (conversation, created) =
                state
                    .conversations
                    .find_or_insert(user_id, other_user, ConversationId::new())?;
            if created {
                state.outbox.push(PushEvent::ConversationCreated {
                    conversation: conversation.clone(),
                });
            }
            Ok(conversation)
        })
    }

    async fn list_messages(
        &self,
        credential: &Credential,
        scope: MessageScope,
    ) -> ClientResult<Vec<MessagePayload>> {
        self.authed(credential, |state, user_id| {
            state.can_read(user_id, scope)?;
            Ok(state
                .messages
                .iter()
                .filter(|message| message.scope == scope)
                .cloned()
                .collect())
        })
    }

    async fn edit_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        self.authed(credential, |state, user_id| {
            state.can_read(user_id, scope)?;
            let message = state
                .messages
                .iter_mut()
                .find(|message| message.message_id == message_id && message.scope == scope)
                .ok_or_else(|| ClientError::NotFound(format!("message {message_id}")))?;
            if message.author_id != user_id {
                return Err(ClientError::Forbidden("only the author edits a message".into()));
            }
            message.content = content.to_string();
            message.edited = true;
            message.updated_at = Utc::now();
            let message = message.clone();
            state.outbox.push(match scope {
                MessageScope::Channel { .. } => PushEvent::MessageUpdated {
                    message: message.clone(),
                },
                MessageScope::Conversation { .. } => PushEvent::PrivateMessageUpdated {
                    message: message.clone(),
                },
            });
            Ok(message)
        })
    }

    async fn delete_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
    ) -> ClientResult<()> {
        self.authed(credential, |state, user_id| {
            state.can_read(user_id, scope)?;
            let before = state.messages.len();
            state
                .messages
                .retain(|message| !(message.message_id == message_id && message.scope == scope));
            if state.messages.len() == before {
                return Err(ClientError::NotFound(format!("message {message_id}")));
            }
            state.outbox.push(match scope {
                MessageScope::Channel {
                    server_id,
                    channel_id,
                } => PushEvent::MessageDeleted {
                    server_id,
                    channel_id,
                    message_id,
                },
                MessageScope::Conversation { conversation_id } => {
                    PushEvent::PrivateMessageDeleted {
                        conversation_id,
                        message_id,
                    }
                }
            });
            Ok(())
        })
    }
}

pub fn fast_transport() -> TransportSettings {
    TransportSettings {
        request_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(500),
        reconnect_initial_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(40),
        reconnect_max_attempts: Some(5),
    }
}

/// One signed-in client wired to the shared backend.
pub struct TestUser {
    pub client: Arc<RealtimeClient>,
    pub connector: Arc<MemoryConnector>,
    pub user_id: UserId,
    pub token: String,
}

impl TestUser {
    pub async fn sign_in(backend: &Arc<FakeBackend>, name: &str) -> TestUser {
        Self::sign_in_with(backend, name, MemoryConnector::new()).await
    }

    pub async fn sign_in_with(
        backend: &Arc<FakeBackend>,
        name: &str,
        (connector, mut peers): (Arc<MemoryConnector>, mpsc::UnboundedReceiver<MemoryPeer>),
    ) -> TestUser {
        let token = format!("{name}-token");
        let user_id = backend.register(name, &token);
        let links = backend.clone();
        tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                links.attach(peer);
            }
        });
        let client = RealtimeClient::new(ClientDependencies {
            connector: connector.clone(),
            refresher: backend.clone(),
            api: backend.clone(),
            store: Arc::new(MemorySessionStore::new()),
            transport: fast_transport(),
        });
        let profile = client
            .login(Credential::new(token.clone()))
            .await
            .expect("login");
        assert_eq!(profile.user_id, user_id);
        TestUser {
            client,
            connector,
            user_id,
            token,
        }
    }
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("client events closed"),
            }
        }
    })
    .await
    .expect("client event should arrive in time")
}

/// Polls until `check` holds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
