use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{AckResult, ClientFrame, LiveRequest, PushEvent, ServerFrame};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header, HeaderValue, StatusCode},
        protocol::frame::coding::CloseCode,
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
    session::Credential,
};

/// Close code a server uses to report that the credential expired mid-connection.
pub const CLOSE_CODE_AUTH_EXPIRED: u16 = 4401;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reauthenticating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Closed(String),
    AuthExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Connected {
        connection_id: u64,
    },
    Disconnected {
        connection_id: u64,
        reason: DisconnectReason,
    },
    AuthError,
    /// An acknowledgement that arrived after its caller already timed out.
    LateAck {
        request_id: u64,
        event: String,
        result: AckResult,
    },
    ReconnectGaveUp {
        attempts: u32,
    },
    /// Timed-out requests whose link is gone. No `LateAck` will follow.
    OrphansDropped {
        request_ids: Vec<u64>,
    },
}

/// What a physical link reports back to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(ServerFrame),
    Closed { reason: String, auth_expired: bool },
}

/// One physical duplex connection. Dropping `outbound` closes it.
pub struct LiveLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Performs the authenticated handshake.
    async fn open(&self, credential: &Credential) -> ClientResult<LiveLink>;
}

pub struct MissingLiveConnector;

#[async_trait]
impl LiveConnector for MissingLiveConnector {
    async fn open(&self, _credential: &Credential) -> ClientResult<LiveLink> {
        Err(ClientError::NetworkUnavailable(
            "live connector is unavailable".into(),
        ))
    }
}

/// Websocket connector carrying the credential as bearer header and cookie.
pub struct WsConnector {
    live_url: String,
    cookie_name: String,
}

impl WsConnector {
    pub fn new(live_url: impl Into<String>, cookie_name: impl Into<String>) -> Self {
        Self {
            live_url: live_url.into(),
            cookie_name: cookie_name.into(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            settings.live_url.clone(),
            settings.credential_cookie_name.clone(),
        )
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn open(&self, credential: &Credential) -> ClientResult<LiveLink> {
        let mut request = self
            .live_url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Config(format!("invalid live url: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| ClientError::AuthRejected)?;
        let cookie = HeaderValue::from_str(&format!(
            "{}={}",
            self.cookie_name,
            credential.expose()
        ))
        .map_err(|_| ClientError::AuthRejected)?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        request.headers_mut().insert(header::COOKIE, cookie);

        let (ws_stream, _) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(response))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                return Err(ClientError::AuthRejected);
            }
            Err(err) => return Err(ClientError::NetworkUnavailable(err.to_string())),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("transport: dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let closed = loop {
                let next = tokio::select! {
                    _ = inbound_tx.closed() => return,
                    next = ws_reader.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if inbound_tx.send(LinkEvent::Frame(frame)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!("transport: invalid server frame: {err}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                            .unwrap_or((u16::from(CloseCode::Normal), String::new()));
                        break LinkEvent::Closed {
                            reason: format!("closed by server ({code}) {reason}")
                                .trim_end()
                                .to_string(),
                            auth_expired: code == CLOSE_CODE_AUTH_EXPIRED,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break LinkEvent::Closed {
                            reason: format!("websocket receive failed: {err}"),
                            auth_expired: false,
                        }
                    }
                    None => {
                        break LinkEvent::Closed {
                            reason: "websocket stream ended".into(),
                            auth_expired: false,
                        }
                    }
                }
            };
            let _ = inbound_tx.send(closed);
        });

        Ok(LiveLink { outbound, inbound })
    }
}

/// Cheap handle onto the currently established connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: Option<u32>,
}

impl From<&ClientSettings> for TransportSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            handshake_timeout: settings.request_timeout,
            reconnect_initial_delay: settings.reconnect_initial_delay,
            reconnect_max_delay: settings.reconnect_max_delay,
            reconnect_max_attempts: settings.reconnect_max_attempts,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

struct PendingAck {
    connection_id: u64,
    event: String,
    reply: oneshot::Sender<ClientResult<Value>>,
}

struct ActiveLink {
    handle: ConnectionHandle,
    reader: JoinHandle<()>,
}

struct TransportState {
    status: ConnectionStatus,
    active: Option<ActiveLink>,
    generation: u64,
    shutdowns: u64,
    last_credential: Option<Credential>,
    pending: HashMap<u64, PendingAck>,
    orphaned: HashMap<u64, (u64, String)>,
    reconnect_task: Option<(u64, JoinHandle<()>)>,
    reconnect_runs: u64,
}

/// Owns the single live connection of a session.
pub struct Transport {
    connector: Arc<dyn LiveConnector>,
    settings: TransportSettings,
    state: Mutex<TransportState>,
    connect_gate: tokio::sync::Mutex<()>,
    next_request_id: AtomicU64,
    signals: broadcast::Sender<TransportSignal>,
    pushes: mpsc::UnboundedSender<PushEvent>,
}

impl Transport {
    /// Returns the transport and the ordered stream of inbound push events.
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        settings: TransportSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PushEvent>) {
        let (signals, _) = broadcast::channel(256);
        let (pushes, pushes_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connector,
            settings,
            state: Mutex::new(TransportState {
                status: ConnectionStatus::Disconnected,
                active: None,
                generation: 0,
                shutdowns: 0,
                last_credential: None,
                pending: HashMap::new(),
                orphaned: HashMap::new(),
                reconnect_task: None,
                reconnect_runs: 0,
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            next_request_id: AtomicU64::new(1),
            signals,
            pushes,
        });
        (transport, pushes_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }

    pub fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }

    /// Counts requested disconnects. A connection attempt that started
    /// before the count moved is abandoned with `SessionClosed`.
    pub fn shutdown_epoch(&self) -> u64 {
        self.lock_state().shutdowns
    }

    /// Connects with `credential`, or hands back the connection that is
    /// already established or being established.
    pub async fn connect(self: &Arc<Self>, credential: Credential) -> ClientResult<ConnectionHandle> {
        let shutdowns = self.shutdown_epoch();
        let _gate = self.connect_gate.lock().await;
        if let Some(handle) = self.active_handle() {
            return Ok(handle);
        }
        self.open_link(credential, false, shutdowns).await
    }

    /// Drops the current connection (if any) and connects with a renewed
    /// credential, unless a disconnect was requested after `shutdowns` was read.
    pub async fn reconnect_with(
        self: &Arc<Self>,
        credential: Credential,
        shutdowns: u64,
    ) -> ClientResult<ConnectionHandle> {
        let _gate = self.connect_gate.lock().await;
        if self.shutdown_epoch() != shutdowns {
            return Err(ClientError::SessionClosed);
        }
        self.teardown(false);
        self.open_link(credential, false, shutdowns).await
    }

    /// Marks the connection as waiting on a credential refresh.
    pub fn mark_reauthenticating(&self) {
        let mut state = self.lock_state();
        if state.active.is_none() {
            state.status = ConnectionStatus::Reauthenticating;
        }
    }

    /// Intentional shutdown: no reconnection follows, and a handshake still
    /// in flight is discarded when it completes.
    pub fn disconnect(&self) {
        let connection_id = {
            let mut state = self.lock_state();
            state.shutdowns += 1;
            state.generation
        };
        if self.teardown(true) {
            info!(connection_id, "transport: disconnected on request");
            let _ = self.signals.send(TransportSignal::Disconnected {
                connection_id,
                reason: DisconnectReason::Requested,
            });
        }
    }

    pub async fn request(&self, request: &LiveRequest) -> ClientResult<Value> {
        self.send(request.event_name(), request.payload()?).await
    }

    /// Reserves an id so the caller can match a later `LateAck` to its request.
    pub fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a live request and waits for its acknowledgement within the
    /// request timeout. No automatic retry.
    pub async fn send(&self, event: &str, payload: Value) -> ClientResult<Value> {
        self.send_with_id(self.allocate_request_id(), event, payload)
            .await
    }

    pub async fn send_with_id(
        &self,
        request_id: u64,
        event: &str,
        payload: Value,
    ) -> ClientResult<Value> {
        let (reply, reply_rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            let connection_id = match (&state.active, state.status) {
                (Some(active), ConnectionStatus::Connected) => active.handle.connection_id,
                _ => return Err(ClientError::NotConnected),
            };
            let frame = ClientFrame::Request {
                request_id,
                event: event.to_string(),
                payload,
            };
            let sent = state
                .active
                .as_ref()
                .is_some_and(|active| active.handle.outbound.send(frame).is_ok());
            if !sent {
                return Err(ClientError::NotConnected);
            }
            state.pending.insert(
                request_id,
                PendingAck {
                    connection_id,
                    event: event.to_string(),
                    reply,
                },
            );
        }
        debug!(request_id, event, "transport: request sent");

        match tokio::time::timeout(self.settings.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                let mut state = self.lock_state();
                if let Some(pending) = state.pending.remove(&request_id) {
                    state
                        .orphaned
                        .insert(request_id, (pending.connection_id, pending.event));
                }
                warn!(request_id, event, "transport: acknowledgement timed out");
                Err(ClientError::Timeout(
                    self.settings.request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn active_handle(&self) -> Option<ConnectionHandle> {
        self.lock_state()
            .active
            .as_ref()
            .map(|active| active.handle.clone())
    }

    /// Must run under `connect_gate`. Rejections seen by a direct caller are
    /// returned to it; rejections seen in the background are signalled.
    async fn open_link(
        self: &Arc<Self>,
        credential: Credential,
        background: bool,
        shutdowns: u64,
    ) -> ClientResult<ConnectionHandle> {
        {
            let mut state = self.lock_state();
            if state.shutdowns != shutdowns {
                return Err(ClientError::SessionClosed);
            }
            state.status = ConnectionStatus::Connecting;
        }
        debug!("transport: handshake started");

        let opened = match tokio::time::timeout(
            self.settings.handshake_timeout,
            self.connector.open(&credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::NetworkUnavailable(
                "handshake timed out".into(),
            )),
        };

        let link = match opened {
            Ok(link) => link,
            Err(err) => {
                let mut state = self.lock_state();
                if state.shutdowns != shutdowns {
                    drop(state);
                    debug!("transport: handshake failed after disconnect: {err}");
                    return Err(ClientError::SessionClosed);
                }
                state.status = ConnectionStatus::Disconnected;
                if err.is_auth_rejected() {
                    drop(state);
                    warn!(background, "transport: handshake rejected credential");
                    if background {
                        let _ = self.signals.send(TransportSignal::AuthError);
                    }
                } else {
                    state.last_credential = Some(credential);
                    drop(state);
                    warn!(background, "transport: handshake failed: {err}");
                    if !background {
                        self.schedule_reconnect();
                    }
                }
                return Err(err);
            }
        };

        let handle = {
            let mut state = self.lock_state();
            if state.shutdowns != shutdowns {
                // Dropping the link closes it on the remote side.
                drop(state);
                drop(link);
                info!("transport: discarding connection opened after disconnect");
                return Err(ClientError::SessionClosed);
            }
            state.generation += 1;
            let handle = ConnectionHandle {
                connection_id: state.generation,
                outbound: link.outbound,
            };
            let transport = Arc::clone(self);
            let reader_id = handle.connection_id;
            let reader = tokio::spawn(async move {
                transport.run_reader(reader_id, link.inbound).await;
            });
            state.active = Some(ActiveLink {
                handle: handle.clone(),
                reader,
            });
            state.last_credential = Some(credential);
            state.status = ConnectionStatus::Connected;
            // A pending reconnect loop notices the live link and exits.
            state.reconnect_task = None;
            handle
        };

        info!(
            connection_id = handle.connection_id,
            "transport: connected"
        );
        let _ = self.signals.send(TransportSignal::Connected {
            connection_id: handle.connection_id,
        });
        Ok(handle)
    }

    async fn run_reader(
        self: Arc<Self>,
        connection_id: u64,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (reason, auth_expired) = loop {
            match inbound.recv().await {
                Some(LinkEvent::Frame(ServerFrame::Ack { request_id, result })) => {
                    self.resolve_ack(request_id, result);
                }
                Some(LinkEvent::Frame(ServerFrame::Push { event, payload })) => {
                    match PushEvent::from_parts(&event, payload) {
                        Ok(push) => {
                            if self.pushes.send(push).is_err() {
                                debug!(event, "transport: push consumer is gone");
                            }
                        }
                        Err(err) => {
                            debug!(event, "transport: ignoring unrecognised push event: {err}")
                        }
                    }
                }
                Some(LinkEvent::Closed {
                    reason,
                    auth_expired,
                }) => break (reason, auth_expired),
                None => break ("link dropped".to_string(), false),
            }
        };
        self.handle_link_lost(connection_id, reason, auth_expired);
    }

    fn resolve_ack(&self, request_id: u64, result: AckResult) {
        let mut state = self.lock_state();
        if let Some(pending) = state.pending.remove(&request_id) {
            drop(state);
            let outcome = match result.clone() {
                AckResult::Ok(value) => Ok(value),
                AckResult::Error(message) => Err(ClientError::Remote(message)),
            };
            if pending.reply.send(outcome).is_err() {
                // The caller's deadline fired between the ack arriving and this send.
                let _ = self.signals.send(TransportSignal::LateAck {
                    request_id,
                    event: pending.event,
                    result,
                });
            }
            return;
        }
        if let Some((_, event)) = state.orphaned.remove(&request_id) {
            drop(state);
            info!(request_id, event, "transport: late acknowledgement received");
            let _ = self.signals.send(TransportSignal::LateAck {
                request_id,
                event,
                result,
            });
            return;
        }
        debug!(request_id, "transport: acknowledgement for unknown request");
    }

    fn handle_link_lost(self: &Arc<Self>, connection_id: u64, reason: String, auth_expired: bool) {
        let orphans = {
            let mut state = self.lock_state();
            let is_current = state
                .active
                .as_ref()
                .is_some_and(|active| active.handle.connection_id == connection_id);
            if !is_current {
                return;
            }
            state.active = None;
            state.status = ConnectionStatus::Disconnected;
            fail_pending(&mut state, Some(connection_id))
        };

        warn!(connection_id, reason, auth_expired, "transport: connection lost");
        let _ = self.signals.send(TransportSignal::Disconnected {
            connection_id,
            reason: if auth_expired {
                DisconnectReason::AuthExpired
            } else {
                DisconnectReason::Closed(reason)
            },
        });
        self.report_orphans(orphans);

        if auth_expired {
            let _ = self.signals.send(TransportSignal::AuthError);
        } else {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.reconnect_task.is_some() || state.last_credential.is_none() {
            return;
        }
        state.reconnect_runs += 1;
        let run = state.reconnect_runs;
        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            transport.reconnect_loop().await;
            let mut state = transport.lock_state();
            if state
                .reconnect_task
                .as_ref()
                .is_some_and(|(current, _)| *current == run)
            {
                state.reconnect_task = None;
            }
        });
        state.reconnect_task = Some((run, task));
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let mut delay = self.settings.reconnect_initial_delay;
        let mut attempts = 0u32;
        loop {
            if let Some(max) = self.settings.reconnect_max_attempts {
                if attempts >= max {
                    warn!(attempts, "transport: giving up on reconnection");
                    let _ = self
                        .signals
                        .send(TransportSignal::ReconnectGaveUp { attempts });
                    return;
                }
            }
            attempts += 1;
            tokio::time::sleep(delay).await;

            let _gate = self.connect_gate.lock().await;
            if self.active_handle().is_some() {
                return;
            }
            let (credential, shutdowns) = {
                let state = self.lock_state();
                match &state.last_credential {
                    Some(credential) => (credential.clone(), state.shutdowns),
                    None => return,
                }
            };
            info!(attempt = attempts, "transport: reconnecting");
            match self.open_link(credential, true, shutdowns).await {
                Ok(_) => return,
                Err(ClientError::AuthRejected | ClientError::SessionClosed) => return,
                Err(err) => {
                    debug!(attempt = attempts, "transport: reconnect attempt failed: {err}");
                    delay = (delay * 2).min(self.settings.reconnect_max_delay);
                }
            }
        }
    }

    /// Returns whether a live connection was dropped.
    fn teardown(&self, forget_credential: bool) -> bool {
        let (dropped, orphans) = {
            let mut state = self.lock_state();
            if let Some((_, task)) = state.reconnect_task.take() {
                task.abort();
            }
            state.generation += 1;
            state.status = ConnectionStatus::Disconnected;
            let orphans = fail_pending(&mut state, None);
            if forget_credential {
                state.last_credential = None;
            }
            let dropped = match state.active.take() {
                Some(active) => {
                    active.reader.abort();
                    true
                }
                None => false,
            };
            (dropped, orphans)
        };
        self.report_orphans(orphans);
        dropped
    }

    fn report_orphans(&self, mut request_ids: Vec<u64>) {
        if request_ids.is_empty() {
            return;
        }
        request_ids.sort_unstable();
        debug!(count = request_ids.len(), "transport: timed-out requests lost with their link");
        let _ = self
            .signals
            .send(TransportSignal::OrphansDropped { request_ids });
    }

    fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fails the waiting requests of `connection_id` (all when `None`) and
/// returns the ids of its timed-out requests, which can no longer be acked.
fn fail_pending(state: &mut TransportState, connection_id: Option<u64>) -> Vec<u64> {
    let ids: Vec<u64> = state
        .pending
        .iter()
        .filter(|(_, pending)| connection_id.map_or(true, |id| pending.connection_id == id))
        .map(|(id, _)| *id)
        .collect();
    for id in ids {
        if let Some(pending) = state.pending.remove(&id) {
            let _ = pending.reply.send(Err(ClientError::NotConnected));
        }
    }
    let orphans: Vec<u64> = state
        .orphaned
        .iter()
        .filter(|(_, (owner, _))| connection_id.map_or(true, |id| *owner == id))
        .map(|(id, _)| *id)
        .collect();
    for id in &orphans {
        state.orphaned.remove(id);
    }
    orphans
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
