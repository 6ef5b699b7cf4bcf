//! Periodic reconciliation sweep.
//!
//! Credits co-present pairs on a fixed tick even when no lifecycle event
//! fires. Each channel produces at most one batched ledger call per tick.
//! The single-task run loop plus skip-on-miss ticking guarantees two sweeps
//! never overlap, which would double count.

use tracing::{debug, warn};

use vt_core::Result;
use vt_core::db::PairDelta;
use vt_core::level::exp_for_interval;
use vt_core::pair::PairKey;

use super::{VoiceTracker, settle};

impl VoiceTracker {
    /// Sweep every enabled community once.
    ///
    /// A store failure drops that channel's interval; it is logged and never
    /// retried, since retrying would double count on the next tick.
    pub async fn reconcile_all(&mut self) {
        let now = self.clock.now_ms();
        let communities = self.config.tracking.enabled_communities.clone();
        for community_id in &communities {
            for channel_id in self.gateway.voice_channels(community_id) {
                if let Err(e) = self.reconcile_channel(community_id, &channel_id, now).await {
                    warn!(
                        community_id = %community_id,
                        channel_id = %channel_id,
                        error = %e,
                        "Reconcile failed, dropping this interval for the channel"
                    );
                }
            }
        }
    }

    async fn reconcile_channel(
        &mut self,
        community_id: &str,
        channel_id: &str,
        now_ms: i64,
    ) -> Result<()> {
        let tick_secs = self.config.tracking.reconcile_interval_secs as i64;
        let ignore_muted = self.config.tracking.ignore_muted;

        // Everyone in the channel, and the mute-filtered subset that accrues
        // time this tick with its unsettled elapsed time, capped at one tick.
        let mut present: Vec<(String, String)> = Vec::new();
        let mut tracked: Vec<(String, String, i64)> = Vec::new();
        for ((community, user), session) in &self.sessions {
            if community != community_id || session.channel_id != channel_id {
                continue;
            }
            present.push((user.clone(), session.session_id.clone()));
            if ignore_muted && session.is_muted {
                continue;
            }
            let elapsed = settle::elapsed_since_marker(session, now_ms, ignore_muted).min(tick_secs);
            tracked.push((user.clone(), session.session_id.clone(), elapsed));
        }

        match tracked.len() {
            0 => {
                // A lone occupant filtered out by mute is still alone.
                if let [(_, session_id)] = present.as_slice() {
                    self.store.mark_session_solo(session_id)?;
                }
                return Ok(());
            }
            1 => {
                let (user_id, session_id, elapsed) = &tracked[0];
                self.store.mark_session_solo(session_id)?;
                if *elapsed > 0 {
                    let amount = exp_for_interval(*elapsed, 0, &self.config.leveling);
                    self.grant_exp(community_id, user_id, amount, now_ms)?;
                    self.store.add_play_time(community_id, user_id, *elapsed)?;
                }
                debug!(
                    community_id = %community_id,
                    channel_id = %channel_id,
                    user_id = %user_id,
                    "Solo presence credited"
                );
            }
            _ => {
                // One batched ledger call for every unordered pair; each pair
                // advances by the overlap of the two members' unsettled time.
                let mut deltas = Vec::new();
                for i in 0..tracked.len() {
                    for j in (i + 1)..tracked.len() {
                        let delta_secs = tracked[i].2.min(tracked[j].2);
                        if delta_secs > 0 {
                            deltas.push(PairDelta {
                                pair: PairKey::new(tracked[i].0.as_str(), tracked[j].0.as_str())?,
                                delta_secs,
                            });
                        }
                    }
                }

                let outcomes = self
                    .store
                    .batch_update_relationships(community_id, &deltas, now_ms)?;
                self.dispatch_milestones(community_id, channel_id, &outcomes, now_ms)
                    .await;

                let partner_count = tracked.len() - 1;
                for (user_id, session_id, elapsed) in &tracked {
                    self.store.mark_session_grouped(session_id)?;
                    if *elapsed > 0 {
                        let amount =
                            exp_for_interval(*elapsed, partner_count, &self.config.leveling);
                        self.grant_exp(community_id, user_id, amount, now_ms)?;
                        self.store.add_play_time(community_id, user_id, *elapsed)?;
                    }
                }
                debug!(
                    community_id = %community_id,
                    channel_id = %channel_id,
                    users = tracked.len(),
                    pairs = outcomes.len(),
                    "Group presence credited"
                );
            }
        }

        // Everything up to now is credited for these sessions.
        for (user_id, session_id, _) in &tracked {
            self.store.advance_settled_marker(session_id, now_ms)?;
            let key = (community_id.to_string(), user_id.clone());
            if let Some(session) = self.sessions.get_mut(&key) {
                settle::advance_marker(session, now_ms);
            }
        }

        Ok(())
    }
}
