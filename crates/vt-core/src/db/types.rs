//! Database types for vt-core.

use serde::{Deserialize, Serialize};

use crate::pair::PairKey;

// ─────────────────────────────────────────────────────────────────────────────
// Entity Types
// ─────────────────────────────────────────────────────────────────────────────

/// A continuous interval during which a user is observed in a voice channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSession {
    pub id: String,
    pub community_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub total_duration_secs: i64,
    pub muted_duration_secs: i64,
    pub active_duration_secs: i64,
    pub is_muted: bool,
    pub is_solo: bool,
    pub has_partners: bool,
    /// When the current mute stretch began, if muted
    pub mute_marker_at: Option<i64>,
    /// Time up to which this session's active time has been settled
    pub settled_marker_at: i64,
    pub status: String,
}

impl VoiceSession {
    pub fn is_open(&self) -> bool {
        self.status == "open"
    }

    /// Whether this session is long enough to appear in display layers.
    /// The threshold never affects recording or aggregation.
    pub fn meets_display_threshold(&self, min_secs: i64) -> bool {
        self.active_duration_secs >= min_secs
    }
}

/// Cumulative pairwise co-presence time. Rows are keyed by the canonical
/// pair ordering and only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRelationship {
    pub community_id: String,
    pub pair: PairKey,
    pub total_time_secs: i64,
    pub last_together_at: i64,
}

/// Per-user progression within a community.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLevel {
    pub community_id: String,
    pub user_id: String,
    pub total_exp: i64,
    pub level: u32,
    pub total_play_time_secs: i64,
    pub unique_partners: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Types (for creating entities)
// ─────────────────────────────────────────────────────────────────────────────

/// Input for creating a new voice session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub community_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub started_at: i64,
    pub is_muted: bool,
}

/// One pair increment within a ledger batch
#[derive(Debug, Clone)]
pub struct PairDelta {
    pub pair: PairKey,
    pub delta_secs: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Types
// ─────────────────────────────────────────────────────────────────────────────

/// Durations computed when a session is closed
#[derive(Debug, Clone, Copy)]
pub struct ClosedSession {
    pub total_duration_secs: i64,
    pub active_duration_secs: i64,
}

/// Before/after totals for one pair in a ledger batch, used for
/// milestone-crossing detection without per-pair reads.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub pair: PairKey,
    pub prev_secs: i64,
    pub new_secs: i64,
}

/// Result of an exp grant
#[derive(Debug, Clone, Copy)]
pub struct ExpOutcome {
    pub old_level: u32,
    pub new_level: u32,
    pub leveled_up: bool,
    pub total_exp: i64,
    /// Amount actually credited after the daily cap
    pub granted: i64,
}

/// Daily exp cap applied to a grant
#[derive(Debug, Clone, Copy)]
pub struct ExpCap {
    pub limit: i64,
    /// Start of the cap window in epoch milliseconds
    pub since_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_threshold() {
        let session = VoiceSession {
            id: "s1".to_string(),
            community_id: "g1".to_string(),
            user_id: "u1".to_string(),
            channel_id: "c1".to_string(),
            started_at: 0,
            ended_at: Some(45_000),
            total_duration_secs: 45,
            muted_duration_secs: 0,
            active_duration_secs: 45,
            is_muted: false,
            is_solo: false,
            has_partners: true,
            mute_marker_at: None,
            settled_marker_at: 45_000,
            status: "closed".to_string(),
        };
        assert!(!session.meets_display_threshold(60));
        assert!(session.meets_display_threshold(45));
        assert!(!session.is_open());
    }
}
