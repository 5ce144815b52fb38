use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, Role, ServerId, UserId},
    error::ApiError,
    protocol::{
        BanSummary, ChannelSummary, ConversationSummary, InviteSummary, MemberSummary,
        MessagePayload, MessageScope, ServerSummary, UserProfile,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
    session::Credential,
};

/// Request/response operations against the application's HTTP API.
#[async_trait]
pub trait CrudApi: Send + Sync {
    async fn profile(&self, credential: &Credential) -> ClientResult<UserProfile>;

    async fn list_servers(&self, credential: &Credential) -> ClientResult<Vec<ServerSummary>>;
    async fn create_server(&self, credential: &Credential, name: &str)
        -> ClientResult<ServerSummary>;
    async fn update_server(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
    ) -> ClientResult<ServerSummary>;
    async fn delete_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()>;
    async fn leave_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()>;

    async fn list_channels(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<ChannelSummary>>;
    async fn create_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
        kind: ChannelKind,
    ) -> ClientResult<ChannelSummary>;
    async fn update_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
        name: &str,
    ) -> ClientResult<ChannelSummary>;
    async fn delete_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> ClientResult<()>;

    async fn list_members(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<MemberSummary>>;
    async fn change_role(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
        role: Role,
    ) -> ClientResult<MemberSummary>;
    async fn kick_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
    ) -> ClientResult<()>;
    async fn transfer_ownership(
        &self,
        credential: &Credential,
        server_id: ServerId,
        new_owner_id: UserId,
    ) -> ClientResult<()>;

    async fn list_bans(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<BanSummary>>;
    async fn ban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
        reason: Option<&str>,
    ) -> ClientResult<BanSummary>;
    async fn unban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
    ) -> ClientResult<()>;

    async fn create_invitation(
        &self,
        credential: &Credential,
        server_id: ServerId,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ClientResult<InviteSummary>;
    async fn join_with_invitation(
        &self,
        credential: &Credential,
        code: &str,
    ) -> ClientResult<ServerSummary>;

    async fn list_conversations(
        &self,
        credential: &Credential,
    ) -> ClientResult<Vec<ConversationSummary>>;
    async fn open_conversation(
        &self,
        credential: &Credential,
        other_user: UserId,
    ) -> ClientResult<ConversationSummary>;

    async fn list_messages(
        &self,
        credential: &Credential,
        scope: MessageScope,
    ) -> ClientResult<Vec<MessagePayload>>;
    async fn edit_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload>;
    async fn delete_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
    ) -> ClientResult<()>;
}

#[derive(Debug, Serialize)]
struct NameRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateChannelRequest<'a> {
    name: &'a str,
    kind: ChannelKind,
}

#[derive(Debug, Serialize)]
struct RoleRequest {
    role: Role,
}

#[derive(Debug, Serialize)]
struct TransferOwnershipRequest {
    new_owner_id: UserId,
}

#[derive(Debug, Serialize)]
struct BanRequest<'a> {
    user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreateInvitationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_uses: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct OpenConversationRequest {
    user_id: UserId,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

fn messages_path(scope: MessageScope) -> String {
    match scope {
        MessageScope::Channel {
            server_id,
            channel_id,
        } => format!("/servers/{server_id}/channels/{channel_id}/messages"),
        MessageScope::Conversation { conversation_id } => {
            format!("/conversations/{conversation_id}/messages")
        }
    }
}

/// `reqwest` implementation. Sends the credential as a bearer token and maps
/// HTTP failures onto [`ClientError`].
pub struct HttpCrudApi {
    http: Client,
    api_url: String,
    timeout: Duration,
}

impl HttpCrudApi {
    pub fn new(api_url: &str, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(&settings.api_url, settings.request_timeout)
    }

    fn request(&self, method: Method, credential: &Credential, path: &str) -> RequestBuilder {
        self.request_to(method, credential, format!("{}{path}", self.api_url))
    }

    fn request_to(&self, method: Method, credential: &Credential, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(credential.expose())
            .timeout(self.timeout)
    }

    /// Invitation codes are user supplied, so they go through percent encoding.
    fn invitation_url(&self, code: &str) -> ClientResult<String> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|err| ClientError::Config(format!("api_url '{}': {err}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("api_url '{}' cannot be a base", self.api_url)))?
            .pop_if_empty()
            .extend(["invitations", code, "join"]);
        Ok(url.into())
    }

    async fn execute(&self, builder: RequestBuilder) -> ClientResult<reqwest::Response> {
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout(self.timeout.as_millis() as u64)
            } else {
                ClientError::from(err)
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ClientResult<T> {
        let response = self.execute(builder).await?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, credential: &Credential, path: &str) -> ClientResult<T> {
        debug!(path, "api: GET");
        self.fetch(self.request(Method::GET, credential, path)).await
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        credential: &Credential,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        debug!(%method, path, "api: request");
        self.fetch(self.request(method, credential, path).json(body))
            .await
    }

    async fn send_empty(&self, method: Method, credential: &Credential, path: &str) -> ClientResult<()> {
        debug!(%method, path, "api: request");
        self.execute(self.request(method, credential, path)).await?;
        Ok(())
    }
}

/// Maps a failed response to the error taxonomy, keeping the server's message
/// when the body carries one.
pub fn status_error(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|api_error| api_error.message)
        .or_else(|_| serde_json::from_str::<ErrorBody>(body).map(|error| error.message))
        .unwrap_or_else(|_| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });
    match status {
        StatusCode::UNAUTHORIZED => ClientError::AuthRejected,
        StatusCode::FORBIDDEN => ClientError::Forbidden(message),
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::CONFLICT => ClientError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::Validation(message)
        }
        _ => ClientError::Remote(format!("{status}: {message}")),
    }
}

#[async_trait]
impl CrudApi for HttpCrudApi {
    async fn profile(&self, credential: &Credential) -> ClientResult<UserProfile> {
        self.get(credential, "/users/me").await
    }

    async fn list_servers(&self, credential: &Credential) -> ClientResult<Vec<ServerSummary>> {
        self.get(credential, "/servers").await
    }

    async fn create_server(
        &self,
        credential: &Credential,
        name: &str,
    ) -> ClientResult<ServerSummary> {
        self.send_json(Method::POST, credential, "/servers", &NameRequest { name })
            .await
    }

    async fn update_server(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
    ) -> ClientResult<ServerSummary> {
        self.send_json(
            Method::PATCH,
            credential,
            &format!("/servers/{server_id}"),
            &NameRequest { name },
        )
        .await
    }

    async fn delete_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()> {
        self.send_empty(Method::DELETE, credential, &format!("/servers/{server_id}"))
            .await
    }

    async fn leave_server(&self, credential: &Credential, server_id: ServerId) -> ClientResult<()> {
        self.send_empty(
            Method::POST,
            credential,
            &format!("/servers/{server_id}/leave"),
        )
        .await
    }

    async fn list_channels(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<ChannelSummary>> {
        self.get(credential, &format!("/servers/{server_id}/channels"))
            .await
    }

    async fn create_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        name: &str,
        kind: ChannelKind,
    ) -> ClientResult<ChannelSummary> {
        self.send_json(
            Method::POST,
            credential,
            &format!("/servers/{server_id}/channels"),
            &CreateChannelRequest { name, kind },
        )
        .await
    }

    async fn update_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
        name: &str,
    ) -> ClientResult<ChannelSummary> {
        self.send_json(
            Method::PATCH,
            credential,
            &format!("/servers/{server_id}/channels/{channel_id}"),
            &NameRequest { name },
        )
        .await
    }

    async fn delete_channel(
        &self,
        credential: &Credential,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> ClientResult<()> {
        self.send_empty(
            Method::DELETE,
            credential,
            &format!("/servers/{server_id}/channels/{channel_id}"),
        )
        .await
    }

    async fn list_members(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<MemberSummary>> {
        self.get(credential, &format!("/servers/{server_id}/members"))
            .await
    }

    async fn change_role(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
        role: Role,
    ) -> ClientResult<MemberSummary> {
        self.send_json(
            Method::PATCH,
            credential,
            &format!("/servers/{server_id}/members/{user_id}"),
            &RoleRequest { role },
        )
        .await
    }

    async fn kick_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
    ) -> ClientResult<()> {
        self.send_empty(
            Method::DELETE,
            credential,
            &format!("/servers/{server_id}/members/{user_id}"),
        )
        .await
    }

    async fn transfer_ownership(
        &self,
        credential: &Credential,
        server_id: ServerId,
        new_owner_id: UserId,
    ) -> ClientResult<()> {
        let _: serde_json::Value = self
            .send_json(
                Method::POST,
                credential,
                &format!("/servers/{server_id}/owner"),
                &TransferOwnershipRequest { new_owner_id },
            )
            .await?;
        Ok(())
    }

    async fn list_bans(
        &self,
        credential: &Credential,
        server_id: ServerId,
    ) -> ClientResult<Vec<BanSummary>> {
        self.get(credential, &format!("/servers/{server_id}/bans"))
            .await
    }

    async fn ban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
        reason: Option<&str>,
    ) -> ClientResult<BanSummary> {
        self.send_json(
            Method::POST,
            credential,
            &format!("/servers/{server_id}/bans"),
            &BanRequest { user_id, reason },
        )
        .await
    }

    async fn unban_member(
        &self,
        credential: &Credential,
        server_id: ServerId,
        user_id: UserId,
    ) -> ClientResult<()> {
        self.send_empty(
            Method::DELETE,
            credential,
            &format!("/servers/{server_id}/bans/{user_id}"),
        )
        .await
    }

    async fn create_invitation(
        &self,
        credential: &Credential,
        server_id: ServerId,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ClientResult<InviteSummary> {
        self.send_json(
            Method::POST,
            credential,
            &format!("/servers/{server_id}/invitations"),
            &CreateInvitationRequest {
                max_uses,
                expires_at,
            },
        )
        .await
    }

    async fn join_with_invitation(
        &self,
        credential: &Credential,
        code: &str,
    ) -> ClientResult<ServerSummary> {
        let url = self.invitation_url(code)?;
        debug!(url = %url, "api: join with invitation");
        self.fetch(self.request_to(Method::POST, credential, url))
            .await
    }

    async fn list_conversations(
        &self,
        credential: &Credential,
    ) -> ClientResult<Vec<ConversationSummary>> {
        self.get(credential, "/conversations").await
    }

    async fn open_conversation(
        &self,
        credential: &Credential,
        other_user: UserId,
    ) -> ClientResult<ConversationSummary> {
        self.send_json(
            Method::POST,
            credential,
            "/conversations",
            &OpenConversationRequest {
                user_id: other_user,
            },
        )
        .await
    }

    async fn list_messages(
        &self,
        credential: &Credential,
        scope: MessageScope,
    ) -> ClientResult<Vec<MessagePayload>> {
        self.get(credential, &messages_path(scope)).await
    }

    async fn edit_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        self.send_json(
            Method::PATCH,
            credential,
            &format!("{}/{message_id}", messages_path(scope)),
            &EditMessageRequest { content },
        )
        .await
    }

    async fn delete_message(
        &self,
        credential: &Credential,
        scope: MessageScope,
        message_id: MessageId,
    ) -> ClientResult<()> {
        self.send_empty(
            Method::DELETE,
            credential,
            &format!("{}/{message_id}", messages_path(scope)),
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
