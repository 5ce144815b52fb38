use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::Mutex;
use tracing::info;
use zeroize::Zeroize;

use crate::error::{ClientError, ClientResult};

/// Opaque bearer token. Never printed, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub credential: Credential,
    pub user_id: UserId,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> ClientResult<Option<Session>>;
    async fn save(&self, session: &Session) -> ClientResult<()>;
    async fn clear(&self) -> ClientResult<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> ClientResult<Option<Session>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> ClientResult<()> {
        *self.slot.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> ClientResult<()> {
        self.slot.lock().await.take();
        Ok(())
    }
}

/// Persists the session as JSON at a fixed path.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> ClientResult<Option<Session>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ClientError::Storage(format!(
                    "failed to read session file '{}': {err}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_str(&raw).map(Some).map_err(|err| {
            ClientError::Storage(format!(
                "invalid session file '{}': {err}",
                self.path.display()
            ))
        })
    }

    async fn save(&self, session: &Session) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                ClientError::Storage(format!(
                    "failed to create session directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
        let mut encoded = serde_json::to_string(session)?;
        let written = tokio::fs::write(&self.path, encoded.as_bytes()).await;
        encoded.zeroize();
        written.map_err(|err| {
            ClientError::Storage(format!(
                "failed to write session file '{}': {err}",
                self.path.display()
            ))
        })
    }

    async fn clear(&self) -> ClientResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ClientError::Storage(format!(
                "failed to remove session file '{}': {err}",
                self.path.display()
            ))),
        }
    }
}

struct SessionSlot {
    session: Option<Session>,
    epoch: u64,
}

/// The single live session of a running client.
///
/// Every `begin`/`clear` bumps the epoch so work started under an older
/// session can tell it has been superseded.
pub struct SessionHandle {
    slot: RwLock<SessionSlot>,
    store: Arc<dyn SessionStore>,
}

impl SessionHandle {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            slot: RwLock::new(SessionSlot {
                session: None,
                epoch: 0,
            }),
            store,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.read(|slot| slot.session.clone())
    }

    pub fn epoch(&self) -> u64 {
        self.read(|slot| slot.epoch)
    }

    pub fn user_id(&self) -> ClientResult<UserId> {
        self.read(|slot| slot.session.as_ref().map(|session| session.user_id))
            .ok_or(ClientError::SessionClosed)
    }

    pub fn credential(&self) -> ClientResult<Credential> {
        self.read(|slot| {
            slot.session
                .as_ref()
                .map(|session| session.credential.clone())
        })
        .ok_or(ClientError::SessionClosed)
    }

    pub async fn begin(&self, session: Session) -> ClientResult<u64> {
        self.store.save(&session).await?;
        let user_id = session.user_id;
        let epoch = self.write(|slot| {
            slot.session = Some(session);
            slot.epoch += 1;
            slot.epoch
        });
        info!(user_id = %user_id, epoch, "session: started");
        Ok(epoch)
    }

    /// Loads a previously persisted session, if any.
    pub async fn restore(&self) -> ClientResult<Option<Session>> {
        let Some(session) = self.store.load().await? else {
            return Ok(None);
        };
        let restored = session.clone();
        self.write(|slot| {
            slot.session = Some(session);
            slot.epoch += 1;
        });
        info!(user_id = %restored.user_id, "session: restored from store");
        Ok(Some(restored))
    }

    /// Swaps in a renewed credential; fails if the session was torn down
    /// or replaced since `expected_epoch`.
    pub async fn replace_credential(
        &self,
        expected_epoch: u64,
        credential: Credential,
    ) -> ClientResult<()> {
        let updated = self.write(|slot| {
            if slot.epoch != expected_epoch {
                return None;
            }
            let session = slot.session.as_mut()?;
            session.credential = credential;
            Some(session.clone())
        });
        let Some(updated) = updated else {
            return Err(ClientError::SessionClosed);
        };
        self.store.save(&updated).await
    }

    pub async fn clear(&self) -> ClientResult<()> {
        let had_session = self.write(|slot| {
            slot.epoch += 1;
            slot.session.take().is_some()
        });
        if had_session {
            info!("session: cleared");
        }
        self.store.clear().await
    }

    /// Clears the session only if it is still the one seen at `expected_epoch`.
    pub async fn end(&self, expected_epoch: u64) -> ClientResult<bool> {
        let ended = self.write(|slot| {
            if slot.epoch != expected_epoch || slot.session.is_none() {
                return false;
            }
            slot.session = None;
            slot.epoch += 1;
            true
        });
        if ended {
            info!(epoch = expected_epoch, "session: ended");
            self.store.clear().await?;
        }
        Ok(ended)
    }

    fn read<T>(&self, f: impl FnOnce(&SessionSlot) -> T) -> T {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut SessionSlot) -> T) -> T {
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
