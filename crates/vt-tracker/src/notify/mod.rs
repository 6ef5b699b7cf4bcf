//! Milestone notification batching and deduplication.
//!
//! Ordinary milestones are coalesced per (community, channel, tier) batch
//! window; a recently flushed message is edited in place to append new
//! participants instead of sending again. Rare high-value tiers bypass
//! batching and go out individually. A per-pair daily cap bounds spam.
//!
//! Delivery is best effort: sink failures are logged and never roll back the
//! ledger or exp mutations that triggered them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use vt_core::Result;
use vt_core::config::{MilestoneConfig, NotificationConfig};
use vt_core::pair::PairKey;

const DAY_MS: i64 = 86_400_000;

/// Handle to a delivered batch message, used for later in-place edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// Outbound notification delivery, implemented by the messaging collaborator.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a coalesced milestone message for a channel
    async fn notify(
        &self,
        community_id: &str,
        channel_id: &str,
        milestone_hours: u32,
        participants: &[String],
    ) -> Result<MessageRef>;

    /// Edit a previously delivered batch message to append a participant
    async fn append_to(&self, message: &MessageRef, participant: &str) -> Result<()>;

    /// Deliver a rare milestone directly to a specific pair
    async fn notify_special(
        &self,
        community_id: &str,
        user_a: &str,
        user_b: &str,
        milestone_hours: u32,
        cumulative_hours: f64,
    ) -> Result<()>;
}

#[derive(Debug)]
enum WindowState {
    Open,
    Flushed { message: MessageRef, flushed_at: i64 },
    Expired,
}

#[derive(Debug)]
struct BatchWindow {
    state: WindowState,
    participants: Vec<String>,
    opened_at: i64,
    updated_at: i64,
}

type WindowKey = (String, String, u32);

/// Detects milestone crossings' delivery obligations and coalesces them.
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    milestones: MilestoneConfig,
    notifications: NotificationConfig,
    /// Live batch windows: (community, channel, hour tier) -> window
    windows: HashMap<WindowKey, BatchWindow>,
    /// Notifications sent per (community, pair, utc day)
    pair_sent: HashMap<(String, PairKey, i64), u32>,
}

impl NotificationDispatcher {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        milestones: MilestoneConfig,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            sink,
            milestones,
            notifications,
            windows: HashMap::new(),
            pair_sent: HashMap::new(),
        }
    }

    /// Handle one milestone crossing for a pair.
    ///
    /// Routes rare tiers to immediate individual delivery and ordinary tiers
    /// into the channel's batch window. Returns without error in all cases;
    /// delivery failures are logged only.
    pub async fn on_pair_milestone(
        &mut self,
        community_id: &str,
        channel_id: &str,
        pair: &PairKey,
        milestone_hours: u32,
        cumulative_secs: i64,
        now_ms: i64,
    ) {
        if !self.under_pair_cap(community_id, pair, now_ms) {
            debug!(
                community_id = %community_id,
                pair = %pair,
                milestone_hours = milestone_hours,
                "Pair notification cap reached, suppressing delivery"
            );
            return;
        }

        if self.milestones.rare_hours.contains(&milestone_hours) {
            let cumulative_hours = cumulative_secs as f64 / 3600.0;
            if let Err(e) = self
                .sink
                .notify_special(
                    community_id,
                    pair.user_a(),
                    pair.user_b(),
                    milestone_hours,
                    cumulative_hours,
                )
                .await
            {
                error!(
                    community_id = %community_id,
                    pair = %pair,
                    error = %e,
                    "Failed to deliver rare milestone notification"
                );
            }
            return;
        }

        self.coalesce(community_id, channel_id, pair, milestone_hours, now_ms)
            .await;
    }

    async fn coalesce(
        &mut self,
        community_id: &str,
        channel_id: &str,
        pair: &PairKey,
        milestone_hours: u32,
        now_ms: i64,
    ) {
        let key = (
            community_id.to_string(),
            channel_id.to_string(),
            milestone_hours,
        );
        let edit_ms = self.notifications.batch_edit_secs * 1000;
        let members = [pair.user_a().to_string(), pair.user_b().to_string()];

        // An editable flushed window appends in place; anything stale is
        // replaced with a fresh open window.
        let replace = match self.windows.get_mut(&key) {
            None => true,
            Some(window) => match &window.state {
                WindowState::Open => {
                    for member in &members {
                        if !window.participants.contains(member) {
                            window.participants.push(member.clone());
                        }
                    }
                    window.updated_at = now_ms;
                    false
                }
                WindowState::Flushed { message, flushed_at }
                    if now_ms - flushed_at <= edit_ms =>
                {
                    let message = message.clone();
                    let new_members: Vec<String> = members
                        .iter()
                        .filter(|m| !window.participants.contains(*m))
                        .cloned()
                        .collect();
                    window.participants.extend(new_members.iter().cloned());
                    window.updated_at = now_ms;
                    for member in &new_members {
                        if let Err(e) = self.sink.append_to(&message, member).await {
                            error!(
                                community_id = %community_id,
                                channel_id = %channel_id,
                                error = %e,
                                "Failed to edit batch message"
                            );
                        }
                    }
                    false
                }
                WindowState::Flushed { .. } | WindowState::Expired => true,
            },
        };

        if replace {
            self.windows.insert(
                key,
                BatchWindow {
                    state: WindowState::Open,
                    participants: members.to_vec(),
                    opened_at: now_ms,
                    updated_at: now_ms,
                },
            );
        }
    }

    /// Flush due windows, expire stale ones, and drop garbage.
    ///
    /// Called from the tracker's periodic tick.
    pub async fn sweep(&mut self, now_ms: i64) {
        let flush_ms = self.notifications.batch_flush_secs * 1000;
        let edit_ms = self.notifications.batch_edit_secs * 1000;
        let ttl_ms = self.notifications.window_ttl_secs * 1000;

        let due: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(_, w)| matches!(w.state, WindowState::Open) && now_ms - w.opened_at >= flush_ms)
            .map(|(k, _)| k.clone())
            .collect();

        for key in due {
            let participants = match self.windows.get(&key) {
                Some(w) => w.participants.clone(),
                None => continue,
            };
            let (community_id, channel_id, hours) = &key;
            match self
                .sink
                .notify(community_id, channel_id, *hours, &participants)
                .await
            {
                Ok(message) => {
                    info!(
                        community_id = %community_id,
                        channel_id = %channel_id,
                        milestone_hours = hours,
                        participants = participants.len(),
                        "Flushed milestone batch"
                    );
                    if let Some(window) = self.windows.get_mut(&key) {
                        window.state = WindowState::Flushed {
                            message,
                            flushed_at: now_ms,
                        };
                        window.updated_at = now_ms;
                    }
                }
                Err(e) => {
                    error!(
                        community_id = %community_id,
                        channel_id = %channel_id,
                        error = %e,
                        "Failed to deliver milestone batch"
                    );
                    if let Some(window) = self.windows.get_mut(&key) {
                        window.state = WindowState::Expired;
                    }
                }
            }
        }

        for window in self.windows.values_mut() {
            if let WindowState::Flushed { flushed_at, .. } = window.state {
                if now_ms - flushed_at > edit_ms {
                    window.state = WindowState::Expired;
                }
            }
        }

        self.windows.retain(|_, w| {
            !matches!(w.state, WindowState::Expired) && now_ms - w.updated_at <= ttl_ms
        });

        let today = now_ms.div_euclid(DAY_MS);
        self.pair_sent.retain(|(_, _, day), _| *day == today);
    }

    /// Live window count (flushed-but-editable windows included)
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn under_pair_cap(&mut self, community_id: &str, pair: &PairKey, now_ms: i64) -> bool {
        let day = now_ms.div_euclid(DAY_MS);
        let count = self
            .pair_sent
            .entry((community_id.to_string(), pair.clone(), day))
            .or_insert(0);
        if *count >= self.notifications.pair_daily_limit {
            return false;
        }
        *count += 1;
        true
    }
}
