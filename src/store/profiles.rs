//! SQLite-backed learning-profile store.
//!
//! Profiles are the only relational data the daemon keeps: per-topic
//! skill rows plus a single stats row. The schema is versioned with
//! forward-only migrations identified by monotonically increasing
//! integers; the stored `user_version` is treated as an opaque counter,
//! never as a feature flag.

use crate::domain::{LearningProfile, TopicSkill};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// Forward-only migrations. Never edit an entry after it has shipped;
/// append a new one.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE topic_skills (
            topic     TEXT PRIMARY KEY,
            level     REAL NOT NULL DEFAULT 0,
            attempts  INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL
        );",
    ),
    (
        2,
        "CREATE TABLE profile_stats (
            id            INTEGER PRIMARY KEY CHECK (id = 1),
            total_runs    INTEGER NOT NULL DEFAULT 0,
            hint_requests INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO profile_stats (id) VALUES (1);",
    ),
    (
        3,
        "ALTER TABLE profile_stats ADD COLUMN avg_time_to_green REAL NOT NULL DEFAULT 0;",
    ),
    (
        4,
        "CREATE TABLE common_errors (
            position INTEGER PRIMARY KEY,
            summary  TEXT NOT NULL UNIQUE
        );",
    ),
];

pub struct ProfileStore {
    conn: Mutex<Connection>,
}

impl ProfileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let db_path = dir.join("profiles.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open profile DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            conn.execute_batch(&format!(
                "BEGIN;\n{sql}\nPRAGMA user_version = {version};\nCOMMIT;"
            ))
            .with_context(|| format!("migration {version} failed"))?;
            tracing::debug!(version, "applied profile schema migration");
        }
        Ok(())
    }

    /// The stored schema version (opaque monotonic integer).
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Assemble the whole profile.
    pub fn load(&self) -> Result<LearningProfile> {
        let conn = self.conn.lock();
        let mut profile = LearningProfile::default();

        let (total_runs, hint_requests, avg): (u32, u32, f64) = conn.query_row(
            "SELECT total_runs, hint_requests, avg_time_to_green FROM profile_stats WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        profile.total_runs = total_runs;
        profile.hint_requests = hint_requests;
        profile.avg_time_to_green_seconds = avg;

        let mut stmt =
            conn.prepare("SELECT topic, level, attempts, last_seen FROM topic_skills")?;
        let rows = stmt.query_map([], |row| {
            let topic: String = row.get(0)?;
            let level: f64 = row.get(1)?;
            let attempts: u32 = row.get(2)?;
            let last_seen: String = row.get(3)?;
            Ok((topic, level, attempts, last_seen))
        })?;
        for row in rows {
            let (topic, level, attempts, last_seen) = row?;
            let last_seen = last_seen
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now());
            profile.topic_skills.insert(
                topic,
                TopicSkill {
                    level,
                    attempts,
                    last_seen,
                },
            );
        }

        let mut stmt = conn.prepare("SELECT summary FROM common_errors ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            profile.common_errors.push(row?);
        }

        Ok(profile)
    }

    /// Persist the whole profile in one transaction.
    pub fn save(&self, profile: &LearningProfile) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE profile_stats
             SET total_runs = ?1, hint_requests = ?2, avg_time_to_green = ?3
             WHERE id = 1",
            params![
                profile.total_runs,
                profile.hint_requests,
                profile.avg_time_to_green_seconds
            ],
        )?;

        tx.execute("DELETE FROM topic_skills", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO topic_skills (topic, level, attempts, last_seen)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (topic, skill) in &profile.topic_skills {
                stmt.execute(params![
                    topic,
                    skill.level,
                    skill.attempts,
                    skill.last_seen.to_rfc3339()
                ])?;
            }
        }

        tx.execute("DELETE FROM common_errors", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO common_errors (position, summary) VALUES (?1, ?2)")?;
            for (position, summary) in profile.common_errors.iter().enumerate() {
                stmt.execute(params![position as i64, summary])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_store_is_at_latest_version() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        assert_eq!(store.schema_version().unwrap(), 4);
        let profile = store.load().unwrap();
        assert_eq!(profile.total_runs, 0);
        assert!(profile.topic_skills.is_empty());
    }

    #[test]
    fn save_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();

        let mut profile = LearningProfile::default();
        let now = Utc::now();
        profile.record_run("ownership", true, now);
        profile.record_run("ownership", false, now);
        profile.record_run("slices", true, now);
        profile.record_hint();
        profile.record_time_to_green(120.0);
        profile.record_common_error("E0382: borrow of moved value");

        store.save(&profile).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.total_runs, 3);
        assert_eq!(loaded.hint_requests, 1);
        assert_eq!(loaded.topic_skills.len(), 2);
        assert_eq!(
            loaded.topic_skills["ownership"].attempts,
            profile.topic_skills["ownership"].attempts
        );
        assert_eq!(loaded.common_errors, profile.common_errors);
        assert!((loaded.avg_time_to_green_seconds - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reopen_does_not_rerun_migrations() {
        let tmp = TempDir::new().unwrap();
        {
            let store = ProfileStore::open(tmp.path()).unwrap();
            let mut profile = LearningProfile::default();
            profile.record_hint();
            store.save(&profile).unwrap();
        }
        let store = ProfileStore::open(tmp.path()).unwrap();
        assert_eq!(store.schema_version().unwrap(), 4);
        assert_eq!(store.load().unwrap().hint_requests, 1);
    }

    #[test]
    fn migrations_are_monotonic() {
        let mut previous = 0;
        for (version, _) in MIGRATIONS {
            assert!(*version > previous, "migration versions must increase");
            previous = *version;
        }
    }

    #[test]
    fn common_errors_keep_order() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        let mut profile = LearningProfile::default();
        profile.record_common_error("first");
        profile.record_common_error("second"); // most recent first
        store.save(&profile).unwrap();
        assert_eq!(store.load().unwrap().common_errors, vec!["second", "first"]);
    }
}
