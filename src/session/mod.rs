//! Session lifecycle service.
//!
//! The manager serializes all mutation of a session behind a per-session
//! async mutex held across the read → mutate → persist critical section.
//! State always round-trips through the store, so a failed write never
//! poisons the in-memory view: the next request re-reads durable state.
//! An inactivity sweeper abandons Active sessions idle past the
//! configured timeout.

use crate::config::SessionSettings;
use crate::domain::{LearningPolicy, Session, SessionMode, SessionStatus};
use crate::error::PairingError;
use crate::store::FileStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct SessionManager {
    store: Arc<FileStore>,
    settings: SessionSettings,
    locks: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<FileStore>, settings: SessionSettings) -> Self {
        Self {
            store,
            settings,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Create and persist a new Active session.
    pub fn create(
        &self,
        mode: SessionMode,
        policy: LearningPolicy,
        exercise_id: Option<String>,
        spec_path: Option<String>,
    ) -> Result<Session, PairingError> {
        let session = Session::new(mode, policy, exercise_id, spec_path, Utc::now())?;
        self.store
            .save_session(&session)
            .map_err(|e| PairingError::Internal(e.to_string()))?;
        Ok(session)
    }

    /// Load a session or fail with `SessionNotFound`.
    pub fn get(&self, id: Uuid) -> Result<Session, PairingError> {
        self.store
            .get_session(id)
            .map_err(|e| PairingError::Internal(e.to_string()))?
            .ok_or(PairingError::SessionNotFound(id))
    }

    /// Run one mutation under the session's mutex: re-read durable state,
    /// apply `mutate`, persist, return. The mutation must succeed before
    /// anything is written.
    pub async fn mutate<T, F>(&self, id: Uuid, mutate: F) -> Result<T, PairingError>
    where
        F: FnOnce(&mut Session) -> Result<T, PairingError>,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut session = self.get(id)?;
        let value = mutate(&mut session)?;
        self.store
            .save_session(&session)
            .map_err(|e| PairingError::Internal(e.to_string()))?;
        Ok(value)
    }

    /// Terminate a session and report its final state. Terminating an
    /// already-terminal session is a no-op.
    pub async fn terminate(&self, id: Uuid, completed: bool) -> Result<Session, PairingError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut session = self.get(id)?;
        if session.is_active() {
            if completed {
                session.complete(Utc::now())?;
            } else {
                session.abandon(Utc::now())?;
            }
            self.store
                .save_session(&session)
                .map_err(|e| PairingError::Internal(e.to_string()))?;
        }
        Ok(session)
    }

    /// Delete a session and everything it owns.
    pub async fn delete(&self, id: Uuid) -> Result<(), PairingError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.store
            .delete_session(id)
            .map_err(|e| PairingError::Internal(e.to_string()))?;
        self.locks.lock().remove(&id);
        Ok(())
    }

    /// Abandon Active sessions idle past the inactivity timeout. Returns
    /// the sessions that were abandoned.
    pub async fn sweep_inactive(&self) -> Vec<Uuid> {
        let timeout = chrono::Duration::seconds(self.settings.inactivity_timeout_seconds as i64);
        let now = Utc::now();
        let mut abandoned = Vec::new();

        let sessions = match self.store.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("session sweep failed to list: {e}");
                return abandoned;
            }
        };

        for session in sessions {
            if session.status != SessionStatus::Active || now - session.updated_at < timeout {
                continue;
            }
            let result = self
                .mutate(session.id, |s| {
                    if s.is_active() {
                        s.abandon(Utc::now())?;
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => {
                    tracing::info!(session_id = %session.id, "abandoned inactive session");
                    abandoned.push(session.id);
                }
                Err(e) => tracing::warn!(session_id = %session.id, "sweep failed: {e}"),
            }
        }

        // Terminal sessions no longer need their mutex entries.
        let mut locks = self.locks.lock();
        for id in &abandoned {
            locks.remove(id);
        }
        abandoned
    }

    /// Background sweeper loop; runs until the daemon exits.
    pub fn spawn_sweeper(self: Arc<Self>, on_abandoned: impl Fn(Uuid) + Send + Sync + 'static) {
        let interval = Duration::from_secs(self.settings.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for id in self.sweep_inactive().await {
                    on_abandoned(id);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Intent, InterventionLevel};
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<SessionManager>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(tmp.path()).unwrap());
        let settings = SessionSettings {
            inactivity_timeout_seconds: 0,
            ..SessionSettings::default()
        };
        (tmp, Arc::new(SessionManager::new(store, settings)))
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();
        let loaded = mgr.get(session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert!(loaded.is_active());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_tmp, mgr) = manager();
        let err = mgr.get(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PairingError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn mutation_persists_durably() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::mentor(), None, None)
            .unwrap();

        mgr.mutate(session.id, |s| {
            s.record_intervention(Intent::Hint, InterventionLevel::CategoryHint, Utc::now())
                .map_err(PairingError::from)
        })
        .await
        .unwrap();

        assert_eq!(mgr.get(session.id).unwrap().hint_count, 1);
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();
        mgr.terminate(session.id, false).await.unwrap();

        let err = mgr
            .mutate(session.id, |s| {
                s.record_run(false, Utc::now()).map_err(PairingError::from)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::SessionNotActive));
        assert_eq!(mgr.get(session.id).unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();
        let first = mgr.terminate(session.id, false).await.unwrap();
        assert_eq!(first.status, SessionStatus::Abandoned);
        let second = mgr.terminate(session.id, true).await.unwrap();
        // Terminal state is final: a later "completed" request cannot flip it.
        assert_eq!(second.status, SessionStatus::Abandoned);
    }

    #[tokio::test]
    async fn terminate_with_completed_outcome() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();
        let ended = mgr.terminate(session.id, true).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_mutations_serialize() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::mentor(), None, None)
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = mgr.clone();
            let id = session.id;
            handles.push(tokio::spawn(async move {
                mgr.mutate(id, |s| {
                    s.record_run(false, Utc::now()).map_err(PairingError::from)
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(mgr.get(session.id).unwrap().run_count, 10);
    }

    #[tokio::test]
    async fn sweep_abandons_idle_sessions() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();

        // Timeout is zero in the test settings: everything idle is stale.
        let abandoned = mgr.sweep_inactive().await;
        assert_eq!(abandoned, vec![session.id]);
        assert_eq!(
            mgr.get(session.id).unwrap().status,
            SessionStatus::Abandoned
        );

        // Second sweep finds nothing.
        assert!(mgr.sweep_inactive().await.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let (_tmp, mgr) = manager();
        let session = mgr
            .create(SessionMode::Greenfield, LearningPolicy::balanced(), None, None)
            .unwrap();
        mgr.delete(session.id).await.unwrap();
        assert!(matches!(
            mgr.get(session.id).unwrap_err(),
            PairingError::SessionNotFound(_)
        ));
    }
}
