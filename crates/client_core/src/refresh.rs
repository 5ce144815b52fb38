use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{
    header::{HeaderMap, COOKIE, SET_COOKIE},
    Client,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
    session::{Credential, SessionHandle},
    transport::Transport,
};

pub const REFRESH_PATH: &str = "/auth/refresh-token";

#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Exchanges the current credential for a renewed one.
    async fn refresh(&self, current: &Credential) -> ClientResult<Credential>;
}

pub struct MissingCredentialRefresher;

#[async_trait]
impl CredentialRefresher for MissingCredentialRefresher {
    async fn refresh(&self, _current: &Credential) -> ClientResult<Credential> {
        Err(ClientError::RefreshDenied(
            "credential refresh is unavailable".into(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "token")]
    access_token: String,
}

/// Calls the refresh endpoint with the session cookie attached. The renewed
/// credential is read from a `Set-Cookie` of the same name, else the JSON body.
pub struct HttpCredentialRefresher {
    http: Client,
    refresh_url: String,
    cookie_name: String,
    timeout: Duration,
}

impl HttpCredentialRefresher {
    pub fn new(
        api_url: &str,
        cookie_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: Client::new(),
            refresh_url: format!("{}{REFRESH_PATH}", api_url.trim_end_matches('/')),
            cookie_name: cookie_name.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            &settings.api_url,
            settings.credential_cookie_name.clone(),
            settings.request_timeout,
        )
    }
}

#[async_trait]
impl CredentialRefresher for HttpCredentialRefresher {
    async fn refresh(&self, current: &Credential) -> ClientResult<Credential> {
        let response = self
            .http
            .post(&self.refresh_url)
            .timeout(self.timeout)
            .header(COOKIE, format!("{}={}", self.cookie_name, current.expose()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::RefreshDenied(format!(
                "refresh endpoint answered {status}"
            )));
        }
        if let Some(token) = cookie_value(response.headers(), &self.cookie_name) {
            return Ok(Credential::new(token));
        }
        let body: RefreshResponse = response.json().await?;
        if body.access_token.is_empty() {
            return Err(ClientError::RefreshDenied(
                "refresh endpoint returned an empty credential".into(),
            ));
        }
        Ok(Credential::new(body.access_token))
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| key.trim() == name && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    Renewed { attempt: u64 },
    /// Terminal: the session was torn down and the user must sign in again.
    SessionEnded { reason: ClientError },
}

type SharedRefresh = Shared<BoxFuture<'static, ClientResult<Credential>>>;

struct InFlight {
    attempt: u64,
    outcome: SharedRefresh,
}

/// Renews the session credential after an authentication failure.
///
/// Concurrent callers join the attempt already in flight. Once an attempt
/// finishes, the next failure starts a new one.
pub struct RefreshCoordinator {
    refresher: Arc<dyn CredentialRefresher>,
    session: Arc<SessionHandle>,
    transport: Arc<Transport>,
    in_flight: Mutex<Option<InFlight>>,
    attempts: AtomicU64,
    events: broadcast::Sender<RefreshEvent>,
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Arc<dyn CredentialRefresher>,
        session: Arc<SessionHandle>,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            refresher,
            session,
            transport,
            in_flight: Mutex::new(None),
            attempts: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// Number of refresh attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The attempt runs on its own task, so a caller that stops waiting does
    /// not cancel it for the others.
    pub async fn handle_auth_failure(self: &Arc<Self>) -> ClientResult<Credential> {
        let outcome = {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(attempt = in_flight.attempt, "refresh: joining attempt in flight");
                    in_flight.outcome.clone()
                }
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let coordinator = Arc::clone(self);
                    let task = tokio::spawn(async move { coordinator.run(attempt).await });
                    let outcome = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(err) => Err(ClientError::RefreshDenied(format!(
                                "refresh task failed: {err}"
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        attempt,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    async fn run(self: Arc<Self>, attempt: u64) -> ClientResult<Credential> {
        let epoch = self.session.epoch();
        let result = self.renew(attempt, epoch).await;

        {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|in_flight| in_flight.attempt == attempt) {
                *slot = None;
            }
        }

        match result {
            Ok(credential) => {
                info!(attempt, "refresh: credential renewed");
                let _ = self.events.send(RefreshEvent::Renewed { attempt });
                Ok(credential)
            }
            Err(ClientError::SessionClosed) => {
                debug!(attempt, "refresh: session ended while refreshing");
                Err(ClientError::SessionClosed)
            }
            Err(_) if self.session.epoch() != epoch => {
                debug!(attempt, "refresh: session replaced while refreshing");
                Err(ClientError::SessionClosed)
            }
            Err(err) => {
                let reason = match err {
                    ClientError::RefreshDenied(_) => err,
                    other => ClientError::RefreshDenied(other.to_string()),
                };
                warn!(attempt, "refresh: failed, ending session: {reason}");
                self.transport.disconnect();
                match self.session.end(epoch).await {
                    Ok(true) => {
                        let _ = self.events.send(RefreshEvent::SessionEnded {
                            reason: reason.clone(),
                        });
                    }
                    Ok(false) => {}
                    Err(store_err) => {
                        warn!(attempt, "refresh: failed to clear stored session: {store_err}");
                        let _ = self.events.send(RefreshEvent::SessionEnded {
                            reason: reason.clone(),
                        });
                    }
                }
                Err(reason)
            }
        }
    }

    async fn renew(&self, attempt: u64, epoch: u64) -> ClientResult<Credential> {
        let current = self.session.credential()?;
        let shutdowns = self.transport.shutdown_epoch();
        self.transport.mark_reauthenticating();
        info!(attempt, "refresh: requesting renewed credential");

        let renewed = self.refresher.refresh(&current).await?;
        self.session
            .replace_credential(epoch, renewed.clone())
            .await?;

        match self.transport.reconnect_with(renewed.clone(), shutdowns).await {
            Ok(_) => Ok(renewed),
            Err(ClientError::AuthRejected) => Err(ClientError::RefreshDenied(
                "renewed credential was rejected by the live endpoint".into(),
            )),
            Err(ClientError::SessionClosed) => Err(ClientError::SessionClosed),
            Err(err) => {
                // The transport keeps retrying with the renewed credential.
                warn!(attempt, "refresh: reconnect after renewal failed: {err}");
                Ok(renewed)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
