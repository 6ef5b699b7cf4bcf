//! Configuration for the voicetime tracker.
//!
//! Configuration is loaded from a TOML file with serde defaults for every
//! field, so a partial file (or no file at all) yields a working setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Presence tracking settings
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Experience and leveling settings
    #[serde(default)]
    pub leveling: LevelingConfig,

    /// Relationship milestone thresholds
    #[serde(default)]
    pub milestones: MilestoneConfig,

    /// Notification batching and spam limits
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Reconciliation sweep interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Sessions shorter than this are hidden from display layers.
    /// Raw time is always recorded and aggregated regardless.
    #[serde(default = "default_min_session")]
    pub min_session_secs: i64,

    /// Exclude muted users from pair accrual
    #[serde(default = "default_true")]
    pub ignore_muted: bool,

    /// Communities with tracking enabled
    #[serde(default)]
    pub enabled_communities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelingConfig {
    /// Base exp per minute of active group voice time
    #[serde(default = "default_exp_per_minute")]
    pub exp_per_minute: i64,

    /// Exp per minute when alone in a channel (0 disables solo exp)
    #[serde(default)]
    pub solo_exp_per_minute: i64,

    /// Bonus percent per additional co-present partner beyond the first
    #[serde(default = "default_partner_bonus")]
    pub partner_bonus_pct: i64,

    /// Upper bound on the partner bonus percent
    #[serde(default = "default_partner_bonus_cap")]
    pub partner_bonus_cap_pct: i64,

    /// Maximum exp a user can earn per cap window (0 disables the cap)
    #[serde(default = "default_daily_exp_cap")]
    pub daily_exp_cap: i64,

    /// How the daily cap window is anchored
    #[serde(default)]
    pub cap_window: CapWindow,
}

/// Daily exp cap window policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapWindow {
    /// UTC calendar day: the window resets at midnight UTC
    #[default]
    CalendarDay,
    /// Rolling window covering the last 24 hours
    #[serde(rename = "rolling_24h")]
    Rolling24h,
}

impl CapWindow {
    /// Start of the cap window containing `now_ms`, in epoch milliseconds.
    pub fn window_start_ms(&self, now_ms: i64) -> i64 {
        const DAY_MS: i64 = 86_400_000;
        match self {
            Self::CalendarDay => now_ms - now_ms.rem_euclid(DAY_MS),
            Self::Rolling24h => now_ms - DAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneConfig {
    /// Cumulative relationship hours that trigger an ordinary milestone
    #[serde(default = "default_milestone_hours")]
    pub relationship_hours: Vec<u32>,

    /// High-value hour tiers delivered individually, bypassing batching
    #[serde(default = "default_rare_hours")]
    pub rare_hours: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Maximum milestone notifications per pair per UTC day
    #[serde(default = "default_pair_daily_limit")]
    pub pair_daily_limit: u32,

    /// Seconds a batch window stays open collecting participants
    #[serde(default = "default_batch_flush")]
    pub batch_flush_secs: i64,

    /// Seconds after flushing during which the message is edited in place
    #[serde(default = "default_batch_edit")]
    pub batch_edit_secs: i64,

    /// Seconds after which stale windows are garbage-collected
    #[serde(default = "default_window_ttl")]
    pub window_ttl_secs: i64,
}

impl TrackerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate constraints the serde layer cannot express.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.tracking.reconcile_interval_secs == 0 {
            return Err(Error::Config(
                "tracking.reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.leveling.partner_bonus_pct < 0 || self.leveling.partner_bonus_cap_pct < 0 {
            return Err(Error::Config(
                "leveling bonus percentages cannot be negative".to_string(),
            ));
        }
        if self.leveling.daily_exp_cap < 0 {
            return Err(Error::Config(
                "leveling.daily_exp_cap cannot be negative (use 0 to disable)".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether voice tracking is enabled for a community.
    pub fn enabled(&self, community_id: &str) -> bool {
        self.tracking
            .enabled_communities
            .iter()
            .any(|c| c == community_id)
    }

    /// Ordinary milestone thresholds in seconds, sorted ascending.
    pub fn milestone_thresholds_secs(&self) -> Vec<i64> {
        let mut secs: Vec<i64> = self
            .milestones
            .relationship_hours
            .iter()
            .map(|h| *h as i64 * 3600)
            .collect();
        secs.sort_unstable();
        secs
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            min_session_secs: default_min_session(),
            ignore_muted: true,
            enabled_communities: Vec::new(),
        }
    }
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            exp_per_minute: default_exp_per_minute(),
            solo_exp_per_minute: 0,
            partner_bonus_pct: default_partner_bonus(),
            partner_bonus_cap_pct: default_partner_bonus_cap(),
            daily_exp_cap: default_daily_exp_cap(),
            cap_window: CapWindow::default(),
        }
    }
}

impl Default for MilestoneConfig {
    fn default() -> Self {
        Self {
            relationship_hours: default_milestone_hours(),
            rare_hours: default_rare_hours(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            pair_daily_limit: default_pair_daily_limit(),
            batch_flush_secs: default_batch_flush(),
            batch_edit_secs: default_batch_edit(),
            window_ttl_secs: default_window_ttl(),
        }
    }
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_min_session() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_exp_per_minute() -> i64 {
    10
}

fn default_partner_bonus() -> i64 {
    10
}

fn default_partner_bonus_cap() -> i64 {
    50
}

fn default_daily_exp_cap() -> i64 {
    1500
}

fn default_milestone_hours() -> Vec<u32> {
    vec![1, 10, 50, 100, 500, 1000]
}

fn default_rare_hours() -> Vec<u32> {
    vec![500, 1000]
}

fn default_pair_daily_limit() -> u32 {
    3
}

fn default_batch_flush() -> i64 {
    30
}

fn default_batch_edit() -> i64 {
    300
}

fn default_window_ttl() -> i64 {
    900
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.tracking.reconcile_interval_secs, 60);
        assert!(config.tracking.ignore_muted);
        assert_eq!(config.leveling.solo_exp_per_minute, 0);
        assert_eq!(config.leveling.cap_window, CapWindow::CalendarDay);
        assert!(!config.enabled("anywhere"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TrackerConfig = toml::from_str(
            r#"
            [tracking]
            enabled_communities = ["g1"]

            [leveling]
            daily_exp_cap = 500
            cap_window = "rolling_24h"
            "#,
        )
        .unwrap();

        assert!(config.enabled("g1"));
        assert!(!config.enabled("g2"));
        assert_eq!(config.leveling.daily_exp_cap, 500);
        assert_eq!(config.leveling.cap_window, CapWindow::Rolling24h);
        // Untouched sections keep defaults
        assert_eq!(config.notifications.pair_daily_limit, 3);
    }

    #[test]
    fn test_cap_window_start() {
        const DAY_MS: i64 = 86_400_000;
        let now = 3 * DAY_MS + 5_000_000;
        assert_eq!(CapWindow::CalendarDay.window_start_ms(now), 3 * DAY_MS);
        assert_eq!(CapWindow::Rolling24h.window_start_ms(now), now - DAY_MS);
    }

    #[test]
    fn test_milestone_thresholds_sorted_secs() {
        let config = TrackerConfig {
            milestones: MilestoneConfig {
                relationship_hours: vec![10, 1, 50],
                rare_hours: vec![],
            },
            ..Default::default()
        };
        assert_eq!(
            config.milestone_thresholds_secs(),
            vec![3600, 36_000, 180_000]
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = TrackerConfig::load(&temp_dir.path().join("missing.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = TrackerConfig::default();
        config.tracking.reconcile_interval_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_rates() {
        let mut config = TrackerConfig::default();
        config.leveling.partner_bonus_pct = -10;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TrackerConfig::default();
        config.leveling.daily_exp_cap = -1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("voicetime.toml");
        std::fs::write(&path, "[tracking]\nreconcile_interval_secs = 0\n").unwrap();
        assert!(TrackerConfig::load(&path).is_err());
    }
}
