//! Session registry
//!
//! Exclusive owner of every [`Session`]. Each session sits behind its own
//! fair async mutex; updates are read-modify-write closures run under that
//! lock, so events for one session apply in arrival order. Updates spanning
//! two sessions lock both in ascending id order.

use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::shared::value_objects::SessionId;
use crate::domain::signaling::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

type SessionCell = Arc<Mutex<Session>>;

/// In-memory session registry
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session in phase Idle
    pub async fn create(&self, id: SessionId) -> Result<Session> {
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&id) {
            return Err(SignalingError::DuplicateSession(id));
        }

        let session = Session::new(id);
        sessions.insert(id, Arc::new(Mutex::new(session.clone())));
        debug!("Created session {}", id);
        Ok(session)
    }

    /// Snapshot of a session
    pub async fn get(&self, id: SessionId) -> Result<Session> {
        let cell = self.cell(id).await?;
        let session = cell.lock().await;
        Ok(session.clone())
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Remove a session; removing an absent session is a no-op
    pub async fn remove(&self, id: SessionId) {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!("Removed session {}", id);
        }
    }

    /// Atomic update of one session
    pub async fn update<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let cell = self.cell(id).await?;
        let mut session = cell.lock().await;
        Ok(f(&mut *session))
    }

    /// Atomic update of two sessions; `f` receives them in argument order
    pub async fn update_pair<R>(
        &self,
        a: SessionId,
        b: SessionId,
        f: impl FnOnce(&mut Session, &mut Session) -> R,
    ) -> Result<R> {
        if a == b {
            return Err(SignalingError::protocol("a session cannot pair with itself"));
        }

        let cell_a = self.cell(a).await?;
        let cell_b = self.cell(b).await?;
        let (mut first, mut second) = lock_both(&cell_a, &cell_b, a, b).await;
        Ok(f(&mut *first, &mut *second))
    }

    /// Atomic update of a session together with its current peer, if the
    /// peer is still registered
    pub async fn update_with_peer<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session, Option<&mut Session>) -> R,
    ) -> Result<R> {
        loop {
            let cell = self.cell(id).await?;
            let peer_id = cell.lock().await.peer();

            let peer_cell = match peer_id {
                Some(peer_id) => self.cell(peer_id).await.ok(),
                None => None,
            };

            match (peer_id, peer_cell) {
                (Some(peer_id), Some(peer_cell)) => {
                    let (mut session, mut peer) = lock_both(&cell, &peer_cell, id, peer_id).await;
                    // Re-pairing between the peek and the lock; start over
                    if session.peer() != Some(peer_id) {
                        continue;
                    }
                    return Ok(f(&mut *session, Some(&mut *peer)));
                }
                (peer_id, _) => {
                    let mut session = cell.lock().await;
                    if session.peer() != peer_id {
                        continue;
                    }
                    return Ok(f(&mut *session, None));
                }
            }
        }
    }

    /// Callers whose offer is committed and who still have no counterpart,
    /// oldest first
    pub async fn waiting_callers(&self, exclude: SessionId) -> Vec<SessionId> {
        self.select(exclude, Session::is_waiting_for_callee).await
    }

    /// Oldest waiting caller, if any
    pub async fn find_waiting_caller(&self, exclude: SessionId) -> Option<SessionId> {
        self.waiting_callers(exclude).await.into_iter().next()
    }

    /// Idle sessions that can be handed an offer, oldest first
    pub async fn available_callees(&self, exclude: SessionId) -> Vec<SessionId> {
        self.select(exclude, Session::is_available_callee).await
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshots of all sessions
    pub async fn list(&self) -> Vec<Session> {
        let mut snapshots = Vec::new();
        for cell in self.cells().await {
            snapshots.push(cell.lock().await.clone());
        }
        snapshots
    }

    async fn select(&self, exclude: SessionId, pred: fn(&Session) -> bool) -> Vec<SessionId> {
        let mut matches = Vec::new();
        for cell in self.cells().await {
            let session = cell.lock().await;
            if session.id() != exclude && pred(&*session) {
                matches.push((*session.created_at(), session.id()));
            }
        }
        matches.sort();
        matches.into_iter().map(|(_, id)| id).collect()
    }

    async fn cell(&self, id: SessionId) -> Result<SessionCell> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SignalingError::NotFound(id))
    }

    async fn cells(&self) -> Vec<SessionCell> {
        self.sessions.read().await.values().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock two distinct sessions in ascending id order, returning the guards in
/// argument order
async fn lock_both<'a>(
    a: &'a SessionCell,
    b: &'a SessionCell,
    a_id: SessionId,
    b_id: SessionId,
) -> (MutexGuard<'a, Session>, MutexGuard<'a, Session>) {
    if a_id < b_id {
        let first = a.lock().await;
        let second = b.lock().await;
        (first, second)
    } else {
        let second = b.lock().await;
        let first = a.lock().await;
        (first, second)
    }
}
