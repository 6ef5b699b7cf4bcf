//! Pure experience and leveling math.
//!
//! The exp-to-level mapping is a deterministic, monotonic function of
//! cumulative exp. Nothing in this module touches the store; callers apply
//! the results through `Store::add_exp_and_check_levelup`.

use crate::config::LevelingConfig;

/// Exp required to advance from `level` to `level + 1`.
///
/// Quadratic curve: early levels come quickly, later ones slow down.
pub fn exp_to_advance(level: u32) -> i64 {
    let l = level as i64;
    5 * l * l + 50 * l + 100
}

/// Cumulative exp required to reach `level` from zero.
pub fn exp_for_level(level: u32) -> i64 {
    (0..level).map(exp_to_advance).sum()
}

/// Level reached with `total_exp` cumulative exp.
pub fn level_for_exp(total_exp: i64) -> u32 {
    let mut level = 0u32;
    let mut remaining = total_exp;
    loop {
        let cost = exp_to_advance(level);
        if remaining < cost {
            return level;
        }
        remaining -= cost;
        level += 1;
    }
}

/// Exp earned for `secs` of active voice time with `partners` co-present
/// partners.
///
/// Zero partners yields the configured solo rate (zero by default). The group
/// rate scales with partner count up to the configured bonus cap.
pub fn exp_for_interval(secs: i64, partners: usize, cfg: &LevelingConfig) -> i64 {
    if secs <= 0 {
        return 0;
    }
    if partners == 0 {
        return cfg.solo_exp_per_minute * secs / 60;
    }
    let extra = (partners as i64 - 1) * cfg.partner_bonus_pct;
    let bonus_pct = extra.min(cfg.partner_bonus_cap_pct);
    cfg.exp_per_minute * (100 + bonus_pct) * secs / (60 * 100)
}

/// Every threshold crossed moving from `prev` to `new`, i.e. all values in
/// `(prev, new]`. Multiple thresholds crossed in one update are all reported.
pub fn crossed_thresholds(prev: i64, new: i64, thresholds: &[i64]) -> Vec<i64> {
    thresholds
        .iter()
        .copied()
        .filter(|t| prev < *t && *t <= new)
        .collect()
}
