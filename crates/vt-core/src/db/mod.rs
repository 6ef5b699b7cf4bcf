//! SQLite-backed presence store for the voicetime tracker.
//!
//! All durable state lives here: voice sessions, the pairwise relationship
//! ledger, per-user levels, and the exp grant audit trail backing the daily
//! cap. Batch ledger updates run inside a single transaction so partial pair
//! updates are never visible to concurrent readers.

pub mod types;

pub use types::*;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::error::{Error, Result};
use crate::level::level_for_exp;
use crate::pair::PairKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS voice_session (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    total_duration_secs INTEGER NOT NULL DEFAULT 0,
    muted_duration_secs INTEGER NOT NULL DEFAULT 0,
    active_duration_secs INTEGER NOT NULL DEFAULT 0,
    is_muted INTEGER NOT NULL DEFAULT 0,
    is_solo INTEGER NOT NULL DEFAULT 0,
    has_partners INTEGER NOT NULL DEFAULT 0,
    mute_marker_at INTEGER,
    settled_marker_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'open'
);
CREATE INDEX IF NOT EXISTS idx_session_active
    ON voice_session (community_id, user_id, status);

CREATE TABLE IF NOT EXISTS user_relationship (
    community_id TEXT NOT NULL,
    user_a TEXT NOT NULL,
    user_b TEXT NOT NULL,
    total_time_secs INTEGER NOT NULL DEFAULT 0,
    last_together_at INTEGER NOT NULL,
    PRIMARY KEY (community_id, user_a, user_b)
);

CREATE TABLE IF NOT EXISTS user_level (
    community_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    total_exp INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 0,
    total_play_time_secs INTEGER NOT NULL DEFAULT 0,
    unique_partners INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (community_id, user_id)
);

CREATE TABLE IF NOT EXISTS exp_grant (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    community_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    granted_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_grant_window
    ON exp_grant (community_id, user_id, granted_at);
";

/// Presence store connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open the store at a specific path, creating the schema if needed
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Database)?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests and ephemeral deployments)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Check store connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(Error::Database)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new open voice session
    pub fn create_session(&self, session: &NewSession) -> Result<String> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let id = uuid::Uuid::new_v4().to_string();
        let mute_marker = session.is_muted.then_some(session.started_at);

        conn.execute(
            "INSERT INTO voice_session
             (id, community_id, user_id, channel_id, started_at, is_muted,
              mute_marker_at, settled_marker_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?5, 'open')",
            params![
                id,
                session.community_id,
                session.user_id,
                session.channel_id,
                session.started_at,
                session.is_muted,
                mute_marker,
            ],
        )?;

        Ok(id)
    }

    /// Get the open session for a user in a community, if any
    pub fn get_active_session(
        &self,
        community_id: &str,
        user_id: &str,
    ) -> Result<Option<VoiceSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, community_id, user_id, channel_id, started_at, ended_at,
                    total_duration_secs, muted_duration_secs, active_duration_secs,
                    is_muted, is_solo, has_partners, mute_marker_at,
                    settled_marker_at, status
             FROM voice_session
             WHERE community_id = ?1 AND user_id = ?2 AND status = 'open'
             ORDER BY started_at DESC LIMIT 1",
        )?;

        Ok(stmt
            .query_row(params![community_id, user_id], Self::map_session)
            .optional()?)
    }

    /// Get a session by id
    pub fn get_session(&self, session_id: &str) -> Result<Option<VoiceSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, community_id, user_id, channel_id, started_at, ended_at,
                    total_duration_secs, muted_duration_secs, active_duration_secs,
                    is_muted, is_solo, has_partners, mute_marker_at,
                    settled_marker_at, status
             FROM voice_session WHERE id = ?1",
        )?;

        Ok(stmt
            .query_row(params![session_id], Self::map_session)
            .optional()?)
    }

    fn map_session(row: &rusqlite::Row) -> rusqlite::Result<VoiceSession> {
        Ok(VoiceSession {
            id: row.get(0)?,
            community_id: row.get(1)?,
            user_id: row.get(2)?,
            channel_id: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            total_duration_secs: row.get(6)?,
            muted_duration_secs: row.get(7)?,
            active_duration_secs: row.get(8)?,
            is_muted: row.get(9)?,
            is_solo: row.get(10)?,
            has_partners: row.get(11)?,
            mute_marker_at: row.get(12)?,
            settled_marker_at: row.get(13)?,
            status: row.get(14)?,
        })
    }

    /// Close a session, computing final durations.
    ///
    /// `active = max(0, total - muted)`; an open mute stretch is folded into
    /// the muted total first.
    pub fn end_session(&self, session_id: &str, ended_at: i64) -> Result<ClosedSession> {
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionMissing(session_id.to_string()))?;

        let total = ((ended_at - session.started_at) / 1000).max(0);
        let mut muted = session.muted_duration_secs;
        if session.is_muted {
            if let Some(marker) = session.mute_marker_at {
                muted += ((ended_at - marker) / 1000).max(0);
            }
        }
        let muted = muted.clamp(0, total);
        let active = (total - muted).max(0);

        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "UPDATE voice_session
             SET ended_at = ?1, total_duration_secs = ?2, muted_duration_secs = ?3,
                 active_duration_secs = ?4, mute_marker_at = NULL, status = 'closed'
             WHERE id = ?5",
            params![ended_at, total, muted, active, session_id],
        )?;

        Ok(ClosedSession {
            total_duration_secs: total,
            active_duration_secs: active,
        })
    }

    /// Update a session's mute state.
    ///
    /// `muted_delta_secs` is the completed mute stretch being folded into the
    /// cumulative muted total; `mute_marker_at` is the start of a new stretch.
    pub fn update_session_mute(
        &self,
        session_id: &str,
        is_muted: bool,
        muted_delta_secs: i64,
        mute_marker_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let updated = conn.execute(
            "UPDATE voice_session
             SET is_muted = ?1,
                 muted_duration_secs = muted_duration_secs + ?2,
                 mute_marker_at = ?3
             WHERE id = ?4 AND status = 'open'",
            params![is_muted, muted_delta_secs.max(0), mute_marker_at, session_id],
        )?;
        if updated == 0 {
            return Err(Error::SessionMissing(session_id.to_string()));
        }
        Ok(())
    }

    /// Mark a session as currently solo
    pub fn mark_session_solo(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "UPDATE voice_session SET is_solo = 1 WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Mark a session as grouped; `has_partners` sticks for the session's life
    pub fn mark_session_grouped(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "UPDATE voice_session SET is_solo = 0, has_partners = 1 WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Advance the settled-time marker after a settlement or reconcile credit
    pub fn advance_settled_marker(&self, session_id: &str, marker_ms: i64) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "UPDATE voice_session SET settled_marker_at = ?1
             WHERE id = ?2 AND settled_marker_at < ?1",
            params![marker_ms, session_id],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relationship Ledger Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the ledger entry for a pair. Order of the two users is irrelevant;
    /// lookups always resolve through the canonical pair key.
    pub fn get_relationship(
        &self,
        community_id: &str,
        user_x: &str,
        user_y: &str,
    ) -> Result<Option<UserRelationship>> {
        let pair = PairKey::new(user_x, user_y)?;
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT total_time_secs, last_together_at FROM user_relationship
             WHERE community_id = ?1 AND user_a = ?2 AND user_b = ?3",
        )?;

        let row = stmt
            .query_row(params![community_id, pair.user_a(), pair.user_b()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;

        Ok(row.map(|(total, last)| UserRelationship {
            community_id: community_id.to_string(),
            pair,
            total_time_secs: total,
            last_together_at: last,
        }))
    }

    /// Apply a batch of pair increments inside one transaction.
    ///
    /// Prior totals for the whole batch are read with a single query so
    /// milestone-crossing detection needs no per-pair reads. Duplicate pairs
    /// in the input are coalesced first. At-least-once semantics: re-applying
    /// the same batch double-counts, so callers must issue each elapsed
    /// interval exactly once.
    pub fn batch_update_relationships(
        &self,
        community_id: &str,
        deltas: &[PairDelta],
        now_ms: i64,
    ) -> Result<Vec<PairOutcome>> {
        if deltas.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce duplicate pairs
        let mut merged: std::collections::BTreeMap<PairKey, i64> = std::collections::BTreeMap::new();
        for delta in deltas {
            if delta.delta_secs <= 0 {
                continue;
            }
            *merged.entry(delta.pair.clone()).or_insert(0) += delta.delta_secs;
        }
        if merged.is_empty() {
            return Ok(Vec::new());
        }

        let users: BTreeSet<&str> = merged
            .keys()
            .flat_map(|p| [p.user_a(), p.user_b()])
            .collect();

        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let tx = conn.transaction()?;

        // Prior totals for the full batch, read once
        let placeholders = vec!["?"; users.len()].join(", ");
        let mut prior: HashMap<(String, String), i64> = HashMap::new();
        {
            let sql = format!(
                "SELECT user_a, user_b, total_time_secs FROM user_relationship
                 WHERE community_id = ? AND user_a IN ({placeholders})"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(std::iter::once(community_id).chain(users.iter().copied())),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?;
            for row in rows {
                let (a, b, total) = row?;
                prior.insert((a, b), total);
            }
        }

        let mut outcomes = Vec::with_capacity(merged.len());
        for (pair, delta_secs) in &merged {
            let key = (pair.user_a().to_string(), pair.user_b().to_string());
            let prev = prior.get(&key).copied().unwrap_or(0);

            tx.execute(
                "INSERT INTO user_relationship
                 (community_id, user_a, user_b, total_time_secs, last_together_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(community_id, user_a, user_b) DO UPDATE SET
                     total_time_secs = total_time_secs + excluded.total_time_secs,
                     last_together_at = excluded.last_together_at",
                params![community_id, pair.user_a(), pair.user_b(), delta_secs, now_ms],
            )?;

            outcomes.push(PairOutcome {
                pair: pair.clone(),
                prev_secs: prev,
                new_secs: prev + delta_secs,
            });
        }

        // Refresh unique partner counts for every user touched by the batch
        for user_id in &users {
            tx.execute(
                "INSERT OR IGNORE INTO user_level (community_id, user_id)
                 VALUES (?1, ?2)",
                params![community_id, user_id],
            )?;
            tx.execute(
                "UPDATE user_level SET unique_partners =
                     (SELECT COUNT(*) FROM user_relationship
                      WHERE community_id = ?1 AND (user_a = ?2 OR user_b = ?2))
                 WHERE community_id = ?1 AND user_id = ?2",
                params![community_id, user_id],
            )?;
        }

        tx.commit()?;
        Ok(outcomes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Leveling Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant exp, apply the daily cap, and detect level-ups.
    ///
    /// The before/after exp values are compared directly, so multiple level
    /// thresholds crossed by one grant are all reflected in the outcome.
    pub fn add_exp_and_check_levelup(
        &self,
        community_id: &str,
        user_id: &str,
        amount: i64,
        now_ms: i64,
        cap: Option<ExpCap>,
    ) -> Result<ExpOutcome> {
        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO user_level (community_id, user_id)
             VALUES (?1, ?2)",
            params![community_id, user_id],
        )?;

        let granted = match cap {
            Some(cap) if cap.limit > 0 => {
                let used: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(amount), 0) FROM exp_grant
                     WHERE community_id = ?1 AND user_id = ?2 AND granted_at >= ?3",
                    params![community_id, user_id, cap.since_ms],
                    |row| row.get(0),
                )?;
                amount.clamp(0, (cap.limit - used).max(0))
            }
            _ => amount.max(0),
        };

        let prev_exp: i64 = tx.query_row(
            "SELECT total_exp FROM user_level WHERE community_id = ?1 AND user_id = ?2",
            params![community_id, user_id],
            |row| row.get(0),
        )?;

        let total_exp = prev_exp + granted;
        let old_level = level_for_exp(prev_exp);
        let new_level = level_for_exp(total_exp);

        if granted > 0 {
            tx.execute(
                "INSERT INTO exp_grant (community_id, user_id, amount, granted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![community_id, user_id, granted, now_ms],
            )?;
            tx.execute(
                "UPDATE user_level SET total_exp = ?3, level = ?4
                 WHERE community_id = ?1 AND user_id = ?2",
                params![community_id, user_id, total_exp, new_level],
            )?;
        }

        tx.commit()?;

        Ok(ExpOutcome {
            old_level,
            new_level,
            leveled_up: new_level > old_level,
            total_exp,
            granted,
        })
    }

    /// Accumulate active voice time on the user's level row
    pub fn add_play_time(&self, community_id: &str, user_id: &str, secs: i64) -> Result<()> {
        if secs <= 0 {
            return Ok(());
        }
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "INSERT INTO user_level (community_id, user_id, total_play_time_secs)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(community_id, user_id) DO UPDATE SET
                 total_play_time_secs = total_play_time_secs + excluded.total_play_time_secs",
            params![community_id, user_id, secs],
        )?;
        Ok(())
    }

    /// Total exp granted to a user since `since_ms`
    pub fn exp_granted_since(
        &self,
        community_id: &str,
        user_id: &str,
        since_ms: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM exp_grant
             WHERE community_id = ?1 AND user_id = ?2 AND granted_at >= ?3",
            params![community_id, user_id, since_ms],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Get a user's level row
    pub fn get_user_level(&self, community_id: &str, user_id: &str) -> Result<Option<UserLevel>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT community_id, user_id, total_exp, level, total_play_time_secs,
                    unique_partners
             FROM user_level WHERE community_id = ?1 AND user_id = ?2",
        )?;

        Ok(stmt
            .query_row(params![community_id, user_id], Self::map_level)
            .optional()?)
    }

    /// Top levels in a community, by exp descending
    pub fn top_levels(&self, community_id: &str, limit: u32) -> Result<Vec<UserLevel>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT community_id, user_id, total_exp, level, total_play_time_secs,
                    unique_partners
             FROM user_level WHERE community_id = ?1
             ORDER BY total_exp DESC LIMIT ?2",
        )?;

        let levels = stmt
            .query_map(params![community_id, limit], Self::map_level)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(levels)
    }

    fn map_level(row: &rusqlite::Row) -> rusqlite::Result<UserLevel> {
        Ok(UserLevel {
            community_id: row.get(0)?,
            user_id: row.get(1)?,
            total_exp: row.get(2)?,
            level: row.get(3)?,
            total_play_time_secs: row.get(4)?,
            unique_partners: row.get(5)?,
        })
    }
}
