use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ChannelId, ChannelKind, ConversationId, MessageId, MessageKind, Role, ServerId, UserId,
};

/// Push event names as they appear on the live connection.
pub mod events {
    pub const SERVER_UPDATED: &str = "server:updated";
    pub const SERVER_DELETED: &str = "server:deleted";
    pub const SERVER_OWNER_CHANGED: &str = "server:ownerChanged";
    pub const MEMBER_JOINED: &str = "member:joined";
    pub const MEMBER_LEFT: &str = "member:left";
    pub const MEMBER_KICKED: &str = "member:kicked";
    pub const MEMBER_BANNED: &str = "member:banned";
    pub const MEMBER_UNBANNED: &str = "member:unbanned";
    pub const MEMBER_ROLE_CHANGED: &str = "member:roleChanged";
    pub const CHANNEL_CREATED: &str = "channel:created";
    pub const CHANNEL_UPDATED: &str = "channel:updated";
    pub const CHANNEL_DELETED: &str = "channel:deleted";
    pub const MESSAGE_CREATED: &str = "message:created";
    pub const MESSAGE_UPDATED: &str = "message:updated";
    pub const MESSAGE_DELETED: &str = "message:deleted";
    pub const CONVERSATION_CREATED: &str = "conversation:created";
    pub const PRIVATE_MESSAGE_CREATED: &str = "privateMessage:created";
    pub const PRIVATE_MESSAGE_UPDATED: &str = "privateMessage:updated";
    pub const PRIVATE_MESSAGE_DELETED: &str = "privateMessage:deleted";
    pub const PRESENCE_ONLINE: &str = "presence:online";
    pub const PRESENCE_OFFLINE: &str = "presence:offline";
}

/// Live request names sent with an acknowledgement.
pub mod requests {
    pub const CREATE_MESSAGE: &str = "createMessage";
    pub const SEND_PRIVATE_MESSAGE: &str = "sendPrivateMessage";
    pub const FIND_ALL_SERVERS: &str = "findAllServers";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub server_id: ServerId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub server_id: ServerId,
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanSummary {
    pub server_id: ServerId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub banned_at: DateTime<Utc>,
    pub banned_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSummary {
    pub code: String,
    pub server_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uses_consumed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub user1: UserId,
    pub user2: UserId,
}

impl ConversationSummary {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.user1 == user_id || self.user2 == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum MessageScope {
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    Conversation {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(flatten)]
    pub scope: MessageScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub message_id: MessageId,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPrivateMessageRequest {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
}

/// Requests carried over the live connection and answered by an acknowledgement.
#[derive(Debug, Clone)]
pub enum LiveRequest {
    CreateMessage(CreateMessageRequest),
    SendPrivateMessage(SendPrivateMessageRequest),
    FindAllServers,
}

impl LiveRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            LiveRequest::CreateMessage(_) => requests::CREATE_MESSAGE,
            LiveRequest::SendPrivateMessage(_) => requests::SEND_PRIVATE_MESSAGE,
            LiveRequest::FindAllServers => requests::FIND_ALL_SERVERS,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            LiveRequest::CreateMessage(request) => serde_json::to_value(request),
            LiveRequest::SendPrivateMessage(request) => serde_json::to_value(request),
            LiveRequest::FindAllServers => Ok(Value::Object(Default::default())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request {
        request_id: u64,
        event: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Ok(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack { request_id: u64, result: AckResult },
    Push { event: String, payload: Value },
}

/// Scoping ids carried by a push event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventScopes {
    pub server_id: Option<ServerId>,
    pub channel_id: Option<ChannelId>,
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum PushEvent {
    #[serde(rename = "server:updated")]
    ServerUpdated { server: ServerSummary },
    #[serde(rename = "server:deleted")]
    ServerDeleted { server_id: ServerId },
    #[serde(rename = "server:ownerChanged")]
    ServerOwnerChanged {
        server_id: ServerId,
        previous_owner_id: UserId,
        new_owner_id: UserId,
    },
    #[serde(rename = "member:joined")]
    MemberJoined { member: MemberSummary },
    #[serde(rename = "member:left")]
    MemberLeft { server_id: ServerId, user_id: UserId },
    #[serde(rename = "member:kicked")]
    MemberKicked { server_id: ServerId, user_id: UserId },
    #[serde(rename = "member:banned")]
    MemberBanned { ban: BanSummary },
    #[serde(rename = "member:unbanned")]
    MemberUnbanned { server_id: ServerId, user_id: UserId },
    #[serde(rename = "member:roleChanged")]
    MemberRoleChanged {
        server_id: ServerId,
        user_id: UserId,
        role: Role,
    },
    #[serde(rename = "channel:created")]
    ChannelCreated { channel: ChannelSummary },
    #[serde(rename = "channel:updated")]
    ChannelUpdated { channel: ChannelSummary },
    #[serde(rename = "channel:deleted")]
    ChannelDeleted {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    #[serde(rename = "message:created")]
    MessageCreated { message: MessagePayload },
    #[serde(rename = "message:updated")]
    MessageUpdated { message: MessagePayload },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        server_id: ServerId,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    #[serde(rename = "conversation:created")]
    ConversationCreated { conversation: ConversationSummary },
    #[serde(rename = "privateMessage:created")]
    PrivateMessageCreated { message: MessagePayload },
    #[serde(rename = "privateMessage:updated")]
    PrivateMessageUpdated { message: MessagePayload },
    #[serde(rename = "privateMessage:deleted")]
    PrivateMessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[serde(rename = "presence:online")]
    PresenceOnline { user_id: UserId },
    #[serde(rename = "presence:offline")]
    PresenceOffline { user_id: UserId },
}

impl PushEvent {
    /// Rebuilds a typed event from the `event`/`payload` pair of a push frame.
    pub fn from_parts(event: &str, payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "event": event, "payload": payload }))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::ServerUpdated { .. } => events::SERVER_UPDATED,
            PushEvent::ServerDeleted { .. } => events::SERVER_DELETED,
            PushEvent::ServerOwnerChanged { .. } => events::SERVER_OWNER_CHANGED,
            PushEvent::MemberJoined { .. } => events::MEMBER_JOINED,
            PushEvent::MemberLeft { .. } => events::MEMBER_LEFT,
            PushEvent::MemberKicked { .. } => events::MEMBER_KICKED,
            PushEvent::MemberBanned { .. } => events::MEMBER_BANNED,
            PushEvent::MemberUnbanned { .. } => events::MEMBER_UNBANNED,
            PushEvent::MemberRoleChanged { .. } => events::MEMBER_ROLE_CHANGED,
            PushEvent::ChannelCreated { .. } => events::CHANNEL_CREATED,
            PushEvent::ChannelUpdated { .. } => events::CHANNEL_UPDATED,
            PushEvent::ChannelDeleted { .. } => events::CHANNEL_DELETED,
            PushEvent::MessageCreated { .. } => events::MESSAGE_CREATED,
            PushEvent::MessageUpdated { .. } => events::MESSAGE_UPDATED,
            PushEvent::MessageDeleted { .. } => events::MESSAGE_DELETED,
            PushEvent::ConversationCreated { .. } => events::CONVERSATION_CREATED,
            PushEvent::PrivateMessageCreated { .. } => events::PRIVATE_MESSAGE_CREATED,
            PushEvent::PrivateMessageUpdated { .. } => events::PRIVATE_MESSAGE_UPDATED,
            PushEvent::PrivateMessageDeleted { .. } => events::PRIVATE_MESSAGE_DELETED,
            PushEvent::PresenceOnline { .. } => events::PRESENCE_ONLINE,
            PushEvent::PresenceOffline { .. } => events::PRESENCE_OFFLINE,
        }
    }

    pub fn scopes(&self) -> EventScopes {
        let server = |server_id: ServerId| EventScopes {
            server_id: Some(server_id),
            ..EventScopes::default()
        };
        match self {
            PushEvent::ServerUpdated { server: summary } => server(summary.server_id),
            PushEvent::ServerDeleted { server_id }
            | PushEvent::ServerOwnerChanged { server_id, .. }
            | PushEvent::MemberLeft { server_id, .. }
            | PushEvent::MemberKicked { server_id, .. }
            | PushEvent::MemberUnbanned { server_id, .. }
            | PushEvent::MemberRoleChanged { server_id, .. } => server(*server_id),
            PushEvent::MemberJoined { member } => server(member.server_id),
            PushEvent::MemberBanned { ban } => server(ban.server_id),
            PushEvent::ChannelCreated { channel } | PushEvent::ChannelUpdated { channel } => {
                EventScopes {
                    server_id: Some(channel.server_id),
                    channel_id: Some(channel.channel_id),
                    conversation_id: None,
                }
            }
            PushEvent::ChannelDeleted {
                server_id,
                channel_id,
            }
            | PushEvent::MessageDeleted {
                server_id,
                channel_id,
                ..
            } => EventScopes {
                server_id: Some(*server_id),
                channel_id: Some(*channel_id),
                conversation_id: None,
            },
            PushEvent::MessageCreated { message }
            | PushEvent::MessageUpdated { message }
            | PushEvent::PrivateMessageCreated { message }
            | PushEvent::PrivateMessageUpdated { message } => message.scope.into(),
            PushEvent::ConversationCreated { conversation } => EventScopes {
                conversation_id: Some(conversation.conversation_id),
                ..EventScopes::default()
            },
            PushEvent::PrivateMessageDeleted {
                conversation_id, ..
            } => EventScopes {
                conversation_id: Some(*conversation_id),
                ..EventScopes::default()
            },
            PushEvent::PresenceOnline { .. } | PushEvent::PresenceOffline { .. } => {
                EventScopes::default()
            }
        }
    }
}

impl From<MessageScope> for EventScopes {
    fn from(scope: MessageScope) -> Self {
        match scope {
            MessageScope::Channel {
                server_id,
                channel_id,
            } => EventScopes {
                server_id: Some(server_id),
                channel_id: Some(channel_id),
                conversation_id: None,
            },
            MessageScope::Conversation { conversation_id } => EventScopes {
                conversation_id: Some(conversation_id),
                ..EventScopes::default()
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
