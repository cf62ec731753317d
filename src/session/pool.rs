use crate::error::{ApiError, ErrorCode, GatewayResult};
use crate::session::{Session, SessionInfo, SessionType};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Registry of live sessions keyed by session id.
///
/// Every read and write goes through one lock over the whole map. Sessions never remove
/// themselves: a session that closed on its own is evicted by the next `get`, by
/// `remove_and_close`, or by the reaper.
#[derive(Default)]
pub struct SessionPool {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, session_id: &str) -> GatewayResult<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found(session_id))?;
        if !session.is_closed() {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(session_id);
            tracing::info!(
                session_id,
                session_type = %session.session_type(),
                "Evicted closed session"
            );
        }
        Err(ApiError::new(ErrorCode::NotFound, "Session not found")
            .with_details(format!("session {session_id} is closed"))
            .into())
    }

    pub async fn put(&self, session: Arc<Session>) -> GatewayResult<()> {
        if session.is_closed() {
            return Err(ApiError::new(ErrorCode::SessionClosed, "Cannot register a closed session")
                .with_details(format!("session_id={}", session.id()))
                .into());
        }

        let mut sessions = self.sessions.write().await;
        match sessions.entry(session.id().to_string()) {
            Entry::Occupied(_) => Err(ApiError::new(
                ErrorCode::AlreadyExists,
                "Session with the same id is already registered",
            )
            .with_details(format!("session_id={}", session.id()))
            .into()),
            Entry::Vacant(entry) => {
                tracing::info!(
                    session_id = %session.id(),
                    session_type = %session.session_type(),
                    "Registered session"
                );
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub async fn remove_and_close(&self, session_id: &str) -> GatewayResult<()> {
        self.remove_matching(session_id, None).await
    }

    /// Like `remove_and_close`, but an entry of another type counts as absent.
    /// Entries that already closed on their own are still removed successfully.
    pub async fn remove_and_close_as(&self, session_id: &str, kind: SessionType) -> GatewayResult<()> {
        self.remove_matching(session_id, Some(kind)).await
    }

    async fn remove_matching(&self, session_id: &str, kind: Option<SessionType>) -> GatewayResult<()> {
        let mut sessions = self.sessions.write().await;
        let matches = sessions
            .get(session_id)
            .is_some_and(|session| kind.is_none_or(|kind| session.session_type() == kind));
        if !matches {
            return Err(not_found(session_id));
        }
        let session = sessions
            .remove(session_id)
            .ok_or_else(|| not_found(session_id))?;
        if !session.is_closed() {
            session.close();
        }
        tracing::info!(session_id, session_type = %session.session_type(), "Removed session");
        Ok(())
    }

    /// Live sessions, optionally restricted to one backend type, oldest first.
    pub async fn list(&self, filter: Option<SessionType>) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<SessionInfo> = sessions
            .values()
            .filter(|session| !session.is_closed())
            .filter(|session| filter.is_none_or(|kind| session.session_type() == kind))
            .map(|session| session.info())
            .collect();
        entries.sort_by_key(|info| info.created_at);
        entries
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drops every entry whose session has closed. Returns how many were removed.
    pub async fn evict_closed(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_closed());
        before - sessions.len()
    }

    /// Periodically evicts closed sessions until the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let evicted = pool.evict_closed().await;
                if evicted > 0 {
                    tracing::info!(evicted, "Reaped closed sessions");
                }
            }
        })
    }
}

fn not_found(session_id: &str) -> crate::error::GatewayError {
    ApiError::new(ErrorCode::NotFound, "Session not found")
        .with_details(format!("session_id={session_id}"))
        .into()
}
