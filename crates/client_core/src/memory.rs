//! In-process loopback connector. Each successful handshake hands the
//! server side of the link to whoever holds the peer receiver.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use shared::protocol::{AckResult, ClientFrame, PushEvent, ServerFrame};
use tokio::sync::mpsc;

use crate::{
    error::{ClientError, ClientResult},
    session::Credential,
    transport::{LinkEvent, LiveConnector, LiveLink},
};

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    rejected: Mutex<HashSet<String>>,
    offline: Mutex<bool>,
    handshake_delay: Duration,
    opens: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        Self::with_handshake_delay(Duration::ZERO)
    }

    pub fn with_handshake_delay(
        handshake_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            rejected: Mutex::new(HashSet::new()),
            offline: Mutex::new(false),
            handshake_delay,
            opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (connector, peers_rx)
    }

    /// Handshakes presenting `token` fail with `AuthRejected` from now on.
    pub fn reject(&self, token: &str) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap_or_else(PoisonError::into_inner) = offline;
    }

    /// Handshakes attempted so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Highest number of handshakes that were ever in flight at once.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveConnector for MemoryConnector {
    async fn open(&self, credential: &Credential) -> ClientResult<LiveLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.offline.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ClientError::NetworkUnavailable(
                "memory connector is offline".into(),
            ));
        }
        let rejected = self
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(credential.expose());
        if rejected {
            return Err(ClientError::AuthRejected);
        }

        let (outbound, frames) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                credential: credential.clone(),
                frames,
                events,
            })
            .map_err(|_| ClientError::NetworkUnavailable("no peer is listening".into()))?;
        Ok(LiveLink { outbound, inbound })
    }
}

/// Server side of one loopback link.
pub struct MemoryPeer {
    pub credential: Credential,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.frames.recv().await
    }

    pub fn push(&self, event: &PushEvent) -> bool {
        let Ok(Value::Object(mut map)) = serde_json::to_value(event) else {
            return false;
        };
        let name = event.name().to_string();
        let payload = map.remove("payload").unwrap_or(Value::Null);
        self.events
            .send(LinkEvent::Frame(ServerFrame::Push {
                event: name,
                payload,
            }))
            .is_ok()
    }

    pub fn ack(&self, request_id: u64, result: AckResult) -> bool {
        self.events
            .send(LinkEvent::Frame(ServerFrame::Ack { request_id, result }))
            .is_ok()
    }

    pub fn close(&self, reason: &str, auth_expired: bool) {
        let _ = self.events.send(LinkEvent::Closed {
            reason: reason.to_string(),
            auth_expired,
        });
    }

    pub fn is_open(&self) -> bool {
        !self.events.is_closed()
    }
}
