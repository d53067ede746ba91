//! Persistence for sessions, runs, and interventions.
//!
//! The store is an anti-corruption boundary: it reads and writes domain
//! values as JSON documents under the data directory and interprets
//! nothing. Every write is atomic against concurrent readers (write to a
//! temp file in the same directory, then rename). Runs and interventions
//! are session-scoped subcollections and are cascade-deleted with their
//! session.
//!
//! Layout under the data directory:
//!
//! ```text
//! sessions/<session_id>.json
//! runs/<session_id>/<run_id>.json
//! interventions/<session_id>/<intervention_id>.json
//! profiles/profiles.db
//! documents/<sha256>
//! ```

pub mod documents;
pub mod profiles;

use crate::domain::{Intervention, Run, Session};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub use documents::DocumentStore;
pub use profiles::ProfileStore;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create) the store layout under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for sub in ["sessions", "runs", "interventions", "profiles", "documents"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("failed to create {}/{sub}", root.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Sessions ─────────────────────────────────────────────────

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.session_path(session.id), &bytes)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        read_json(&self.session_path(id))
    }

    /// Delete a session and everything it owns.
    pub fn delete_session(&self, id: Uuid) -> Result<()> {
        let path = self.session_path(id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
        }
        for sub in ["runs", "interventions"] {
            let dir = self.root.join(sub).join(id.to_string());
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to delete {}", dir.display()))?;
            }
        }
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = read_dir_json(&self.root.join("sessions"))?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    // ── Runs ─────────────────────────────────────────────────────

    pub fn save_run(&self, run: &Run) -> Result<()> {
        let dir = self.root.join("runs").join(run.session_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec_pretty(run)?;
        write_atomic(&dir.join(format!("{}.json", run.id)), &bytes)
    }

    pub fn get_run(&self, session_id: Uuid, run_id: Uuid) -> Result<Option<Run>> {
        let path = self
            .root
            .join("runs")
            .join(session_id.to_string())
            .join(format!("{run_id}.json"));
        read_json(&path)
    }

    pub fn list_runs(&self, session_id: Uuid) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = read_dir_json(&self.root.join("runs").join(session_id.to_string()))?;
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    // ── Interventions ────────────────────────────────────────────

    pub fn save_intervention(&self, intervention: &Intervention) -> Result<()> {
        let dir = self
            .root
            .join("interventions")
            .join(intervention.session_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec_pretty(intervention)?;
        write_atomic(&dir.join(format!("{}.json", intervention.id)), &bytes)
    }

    pub fn list_interventions(&self, session_id: Uuid) -> Result<Vec<Intervention>> {
        let mut interventions: Vec<Intervention> =
            read_dir_json(&self.root.join("interventions").join(session_id.to_string()))?;
        interventions.sort_by_key(|i| i.created_at);
        Ok(interventions)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Write via a sibling temp file and rename, so readers only ever observe
/// a complete document.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt document: {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(value) = read_json(&path)? {
            out.push(value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Intent, InterventionLevel, InterventionType, Language, LearningPolicy, Recipe, Session,
        SessionMode,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn session() -> Session {
        Session::new(
            SessionMode::Greenfield,
            LearningPolicy::balanced(),
            None,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn save_then_get_round_trips() {
        let (_tmp, store) = store();
        let mut s = session();
        s.code.insert("main.rs".into(), "fn main() {}".into());
        store.save_session(&s).unwrap();

        let loaded = store.get_session(s.id).unwrap().unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.code, s.code);
        assert_eq!(loaded.policy, s.policy);
    }

    #[test]
    fn get_missing_is_none() {
        let (_tmp, store) = store();
        assert!(store.get_session(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_atomically() {
        let (_tmp, store) = store();
        let mut s = session();
        store.save_session(&s).unwrap();
        s.hint_count = 7;
        store.save_session(&s).unwrap();
        assert_eq!(store.get_session(s.id).unwrap().unwrap().hint_count, 7);
    }

    #[test]
    fn list_sessions_sorted_by_creation() {
        let (_tmp, store) = store();
        let a = session();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = session();
        store.save_session(&b).unwrap();
        store.save_session(&a).unwrap();
        let listed = store.list_sessions().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);
    }

    #[test]
    fn cascade_delete_removes_owned_collections() {
        let (_tmp, store) = store();
        let s = session();
        store.save_session(&s).unwrap();

        let run = Run::new(s.id, Language::Rust, BTreeMap::new(), Recipe::default());
        store.save_run(&run).unwrap();

        let iv = Intervention::new(
            s.id,
            Some(run.id),
            Intent::Hint,
            InterventionLevel::CategoryHint,
            InterventionType::Hint,
            "hint text".into(),
            Utc::now(),
        );
        store.save_intervention(&iv).unwrap();

        assert_eq!(store.list_runs(s.id).unwrap().len(), 1);
        assert_eq!(store.list_interventions(s.id).unwrap().len(), 1);

        store.delete_session(s.id).unwrap();
        assert!(store.get_session(s.id).unwrap().is_none());
        assert!(store.list_runs(s.id).unwrap().is_empty());
        assert!(store.list_interventions(s.id).unwrap().is_empty());
    }

    #[test]
    fn scoped_collections_do_not_leak_across_sessions() {
        let (_tmp, store) = store();
        let a = session();
        let b = session();
        let run_a = Run::new(a.id, Language::Go, BTreeMap::new(), Recipe::default());
        store.save_run(&run_a).unwrap();
        assert_eq!(store.list_runs(a.id).unwrap().len(), 1);
        assert!(store.list_runs(b.id).unwrap().is_empty());
    }

    #[test]
    fn run_round_trip_preserves_output() {
        let (_tmp, store) = store();
        let s = session();
        let mut run = Run::new(s.id, Language::Python, BTreeMap::new(), Recipe::default());
        run.status = crate::domain::RunStatus::Completed;
        run.output = Some(crate::domain::RunOutput {
            build_ok: true,
            format_ok: true,
            tests_passed: 2,
            tests_failed: 1,
            ..Default::default()
        });
        store.save_run(&run).unwrap();
        let loaded = store.get_run(s.id, run.id).unwrap().unwrap();
        assert_eq!(loaded.output.unwrap().tests_passed, 2);
    }

    #[test]
    fn non_json_files_are_ignored() {
        let (tmp, store) = store();
        std::fs::write(tmp.path().join("sessions").join("README"), b"ignore me").unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
    }
}
