//! In-memory session store for tests/dev.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_core::{CommitOutcome, Session, SessionId, SessionMeta, SessionStatus, UserId};

use super::store::{BeginOutcome, SessionStore, SessionStoreError};

/// Each operation takes the write lock once, so it is atomic per session in
/// the same way a single-document update is.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<SessionId, Session>>, SessionStoreError> {
        self.inner
            .read()
            .map_err(|_| SessionStoreError::Unavailable("in-memory session store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<SessionId, Session>>, SessionStoreError> {
        self.inner
            .write()
            .map_err(|_| SessionStoreError::Unavailable("in-memory session store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), SessionStoreError> {
        let mut map = self.write()?;
        if map.contains_key(&session.session_id) {
            return Err(SessionStoreError::AlreadyExists(session.session_id));
        }
        map.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>, SessionStoreError> {
        Ok(self.read()?.get(&session_id).cloned())
    }

    async fn get_owned(
        &self,
        session_id: SessionId,
        owner_id: UserId,
    ) -> Result<Option<Session>, SessionStoreError> {
        Ok(self
            .read()?
            .get(&session_id)
            .filter(|s| s.owner_id == owner_id)
            .cloned())
    }

    async fn list_for_owner(&self, owner_id: UserId, limit: usize) -> Result<Vec<Session>, SessionStoreError> {
        let mut out: Vec<Session> = self
            .read()?
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn begin_attempt(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, SessionStoreError> {
        let mut map = self.write()?;
        let Some(session) = map.get_mut(&session_id) else {
            return Ok(BeginOutcome::NotFound);
        };

        if session.status.is_terminal() {
            return Ok(BeginOutcome::Terminal(session.clone()));
        }

        let fence = session.begin_attempt(now)?;
        Ok(BeginOutcome::Started {
            fence,
            session: session.clone(),
        })
    }

    async fn complete(
        &self,
        session_id: SessionId,
        fence: u32,
        reply: &str,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        let mut map = self.write()?;
        let session = map
            .get_mut(&session_id)
            .ok_or(SessionStoreError::NotFound(session_id))?;
        Ok(session.complete(fence, reply, meta, now))
    }

    async fn fail(
        &self,
        session_id: SessionId,
        fence: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        let mut map = self.write()?;
        let session = map
            .get_mut(&session_id)
            .ok_or(SessionStoreError::NotFound(session_id))?;
        Ok(session.fail(fence, error, now))
    }

    async fn list_orphaned(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>, SessionStoreError> {
        let mut out: Vec<Session> = self
            .read()?
            .values()
            .filter(|s| s.status == SessionStatus::Queued && s.attempt == 0 && s.created_at < older_than)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_core::{ChatMessage, MessageRole};

    fn session(owner: UserId, msg: &str, created_at: DateTime<Utc>) -> Session {
        Session::new(SessionId::new(), owner, msg, created_at).unwrap()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_session_id() {
        let store = InMemorySessionStore::new();
        let s = session(UserId::new(), "Hello", Utc::now());
        store.create(&s).await.unwrap();
        assert_eq!(
            store.create(&s).await,
            Err(SessionStoreError::AlreadyExists(s.session_id))
        );
    }

    #[tokio::test]
    async fn get_owned_hides_foreign_sessions() {
        let store = InMemorySessionStore::new();
        let owner = UserId::new();
        let s = session(owner, "Hello", Utc::now());
        store.create(&s).await.unwrap();

        assert!(store.get_owned(s.session_id, owner).await.unwrap().is_some());
        assert!(store.get_owned(s.session_id, UserId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn begin_attempt_bumps_fence_and_short_circuits_terminal() {
        let store = InMemorySessionStore::new();
        let s = session(UserId::new(), "Hello", Utc::now());
        store.create(&s).await.unwrap();

        let BeginOutcome::Started { fence, session } = store.begin_attempt(s.session_id, Utc::now()).await.unwrap()
        else {
            panic!("expected Started");
        };
        assert_eq!(fence, 1);
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(session.started_at.is_some());

        let outcome = store
            .complete(s.session_id, fence, "Hi there", SessionMeta::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Applied);

        match store.begin_attempt(s.session_id, Utc::now()).await.unwrap() {
            BeginOutcome::Terminal(t) => {
                assert_eq!(t.status, SessionStatus::Completed);
                assert_eq!(t.attempt, 1);
            }
            other => panic!("expected Terminal, got {other:?}"),
        }

        assert_eq!(
            store.begin_attempt(SessionId::new(), Utc::now()).await.unwrap(),
            BeginOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn commit_with_stale_fence_changes_nothing() {
        let store = InMemorySessionStore::new();
        let s = session(UserId::new(), "Hello", Utc::now());
        store.create(&s).await.unwrap();

        store.begin_attempt(s.session_id, Utc::now()).await.unwrap();
        store.begin_attempt(s.session_id, Utc::now()).await.unwrap();

        let outcome = store
            .complete(s.session_id, 1, "late duplicate", SessionMeta::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Stale);

        let stored = store.get(s.session_id).await.unwrap().unwrap();
        assert_eq!(stored.messages, vec![ChatMessage::user("Hello")]);
        assert_eq!(stored.status, SessionStatus::Processing);
        assert_eq!(stored.attempt, 2);

        store
            .complete(s.session_id, 2, "Hi there", SessionMeta::new(), Utc::now())
            .await
            .unwrap();
        let stored = store.get(s.session_id).await.unwrap().unwrap();
        assert_eq!(
            stored.messages.iter().filter(|m| m.role == MessageRole::Assistant).count(),
            1
        );
    }

    #[tokio::test]
    async fn list_for_owner_is_newest_first_and_limited() {
        let store = InMemorySessionStore::new();
        let owner = UserId::new();
        let base = Utc::now();
        for i in 0..3 {
            store
                .create(&session(owner, &format!("m{i}"), base + Duration::seconds(i)))
                .await
                .unwrap();
        }
        store.create(&session(UserId::new(), "other", base)).await.unwrap();

        let list = store.list_for_owner(owner, 2).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].messages[0].content, "m2");
        assert_eq!(list[1].messages[0].content, "m1");
    }

    #[tokio::test]
    async fn list_orphaned_only_returns_untouched_old_sessions() {
        let store = InMemorySessionStore::new();
        let owner = UserId::new();
        let now = Utc::now();

        let old = session(owner, "old", now - Duration::minutes(10));
        let fresh = session(owner, "fresh", now);
        let started = session(owner, "started", now - Duration::minutes(10));
        for s in [&old, &fresh, &started] {
            store.create(s).await.unwrap();
        }
        store.begin_attempt(started.session_id, now).await.unwrap();

        let orphans = store.list_orphaned(now - Duration::minutes(5), 10).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].session_id, old.session_id);
    }
}
