//! Session lifecycle: join, leave, move, and mute transitions.
//!
//! Every handler is a best-effort operation: a missing session on leave or
//! mute means state was already reconciled elsewhere and is logged, not
//! surfaced. Ledger and exp writes propagate errors so a failed interval is
//! dropped rather than retried.

use tracing::{debug, error, info, warn};

use vt_core::db::{ExpCap, NewSession, PairDelta, PairOutcome};
use vt_core::level::{crossed_thresholds, exp_for_interval};
use vt_core::pair::PairKey;
use vt_core::{Error, Result};

use super::{ActiveSession, VoiceTracker, settle};
use crate::event::{Participant, VoiceEvent};

impl VoiceTracker {
    /// Dispatch one gateway event, logging failures per their class.
    pub async fn handle_event(&mut self, event: VoiceEvent) {
        let result = match event {
            VoiceEvent::Join {
                community_id,
                channel_id,
                member,
                is_muted,
                at,
            } => self.on_join(&community_id, &channel_id, &member, is_muted, at).await,
            VoiceEvent::Leave {
                community_id,
                channel_id,
                member,
                at,
            } => self.on_leave(&community_id, &channel_id, &member, at).await,
            VoiceEvent::Move {
                community_id,
                from_channel_id,
                to_channel_id,
                member,
                is_muted,
                at,
            } => {
                self.on_move(&community_id, &from_channel_id, &to_channel_id, &member, is_muted, at)
                    .await
            }
            VoiceEvent::MuteChange {
                community_id,
                member,
                was_muted,
                now_muted,
                at,
            } => {
                let key = (community_id.clone(), member.id.clone());
                if let Some(session) = self.sessions.get(&key) {
                    if session.is_muted != was_muted {
                        debug!(
                            community_id = %community_id,
                            user_id = %member.id,
                            gateway_was_muted = was_muted,
                            tracked_is_muted = session.is_muted,
                            "Gateway mute state disagrees with tracked session"
                        );
                    }
                }
                self.on_mute_change(&community_id, &member, now_muted, at).await
            }
        };

        if let Err(e) = result {
            if e.is_best_effort() {
                debug!(error = %e, "Voice event skipped");
            } else {
                error!(error = %e, "Voice event failed");
            }
        }
    }

    /// Start tracking a user who joined a voice channel.
    pub async fn on_join(
        &mut self,
        community_id: &str,
        channel_id: &str,
        member: &Participant,
        is_muted: bool,
        at: i64,
    ) -> Result<()> {
        if !self.config.enabled(community_id) || member.is_bot {
            return Ok(());
        }

        let key: super::SessionKey = (community_id.to_string(), member.id.clone());
        if let Some(stale) = self.sessions.get(&key) {
            // A join without a matching leave: settle and close the old
            // session first.
            let stale_channel = stale.channel_id.clone();
            warn!(
                community_id = %community_id,
                user_id = %member.id,
                channel_id = %stale_channel,
                "Join with session already tracked, closing stale session"
            );
            self.on_leave(community_id, &stale_channel, member, at).await?;
        }

        let session_id = self.store.create_session(&NewSession {
            community_id: community_id.to_string(),
            user_id: member.id.clone(),
            channel_id: channel_id.to_string(),
            started_at: at,
            is_muted,
        })?;

        self.sessions.insert(
            key,
            ActiveSession {
                session_id: session_id.clone(),
                channel_id: channel_id.to_string(),
                member: member.clone(),
                settled_marker_at: at,
                is_muted,
                mute_marker_at: is_muted.then_some(at),
            },
        );

        debug!(
            community_id = %community_id,
            user_id = %member.id,
            channel_id = %channel_id,
            session_id = %session_id,
            "Voice session started"
        );
        Ok(())
    }

    /// Stop tracking a user who left a voice channel, settling their
    /// unsettled time against everyone still present.
    pub async fn on_leave(
        &mut self,
        community_id: &str,
        _channel_id: &str,
        member: &Participant,
        at: i64,
    ) -> Result<()> {
        if !self.config.enabled(community_id) || member.is_bot {
            return Ok(());
        }

        let key: super::SessionKey = (community_id.to_string(), member.id.clone());
        let session = match self.sessions.remove(&key) {
            Some(session) => session,
            // After a restart the index may be cold; fall back to the store.
            None => match self.store.get_active_session(community_id, &member.id)? {
                Some(row) => ActiveSession::from_row(&row, member.clone()),
                None => {
                    debug!(
                        community_id = %community_id,
                        user_id = %member.id,
                        "Leave without an active session, ignoring"
                    );
                    return Ok(());
                }
            },
        };

        let partners = self.partners_in_channel(community_id, &session.channel_id, &member.id);
        let elapsed = settle::elapsed_since_marker(&session, at, self.config.tracking.ignore_muted);
        self.apply_settlement(
            community_id,
            &session.channel_id,
            &member.id,
            &partners,
            elapsed,
            at,
        )
        .await?;

        let closed = self.store.end_session(&session.session_id, at)?;
        info!(
            community_id = %community_id,
            user_id = %member.id,
            channel_id = %session.channel_id,
            total_secs = closed.total_duration_secs,
            active_secs = closed.active_duration_secs,
            "Voice session closed"
        );
        Ok(())
    }

    /// Channel move: strictly leave-then-join so time in the old channel is
    /// fully settled immediately.
    pub async fn on_move(
        &mut self,
        community_id: &str,
        from_channel_id: &str,
        to_channel_id: &str,
        member: &Participant,
        is_muted: bool,
        at: i64,
    ) -> Result<()> {
        self.on_leave(community_id, from_channel_id, member, at).await?;
        self.on_join(community_id, to_channel_id, member, is_muted, at).await
    }

    /// Mute transition. Unmuting settles the elapsed active window for the
    /// current partner set, bounding a long session's staleness to one mute
    /// cycle.
    pub async fn on_mute_change(
        &mut self,
        community_id: &str,
        member: &Participant,
        now_muted: bool,
        at: i64,
    ) -> Result<()> {
        if !self.config.enabled(community_id) || member.is_bot {
            return Ok(());
        }

        let key: super::SessionKey = (community_id.to_string(), member.id.clone());
        if !self.sessions.contains_key(&key) {
            let row = self
                .store
                .get_active_session(community_id, &member.id)?
                .ok_or_else(|| Error::session_not_found(community_id, &member.id))?;
            self.sessions
                .insert(key.clone(), ActiveSession::from_row(&row, member.clone()));
        }

        let session = match self.sessions.get(&key) {
            Some(session) => session.clone(),
            None => return Err(Error::session_not_found(community_id, &member.id)),
        };
        if session.is_muted == now_muted {
            return Ok(());
        }

        if now_muted {
            // Entering mute: open a stretch.
            self.store
                .update_session_mute(&session.session_id, true, 0, Some(at))?;
            if let Some(s) = self.sessions.get_mut(&key) {
                s.is_muted = true;
                s.mute_marker_at = Some(at);
            }
        } else {
            // Leaving mute: settle the active window, then fold the completed
            // stretch into the session's muted total.
            let elapsed =
                settle::elapsed_since_marker(&session, at, self.config.tracking.ignore_muted);
            let partners =
                self.partners_in_channel(community_id, &session.channel_id, &member.id);
            self.apply_settlement(
                community_id,
                &session.channel_id,
                &member.id,
                &partners,
                elapsed,
                at,
            )
            .await?;

            let stretch_secs = session
                .mute_marker_at
                .map(|marker| ((at - marker) / 1000).max(0))
                .unwrap_or(0);
            self.store
                .update_session_mute(&session.session_id, false, stretch_secs, None)?;
            self.store.advance_settled_marker(&session.session_id, at)?;
            if let Some(s) = self.sessions.get_mut(&key) {
                s.is_muted = false;
                s.mute_marker_at = None;
                settle::advance_marker(s, at);
            }
        }

        debug!(
            community_id = %community_id,
            user_id = %member.id,
            now_muted = now_muted,
            "Mute state changed"
        );
        Ok(())
    }

    /// Tracked partners in a channel, excluding `user_id` and, with mute
    /// filtering on, anyone currently muted.
    pub(crate) fn partners_in_channel(
        &self,
        community_id: &str,
        channel_id: &str,
        user_id: &str,
    ) -> Vec<String> {
        let ignore_muted = self.config.tracking.ignore_muted;
        self.sessions
            .iter()
            .filter(|((community, user), session)| {
                community == community_id
                    && session.channel_id == channel_id
                    && user != user_id
                    && !(ignore_muted && session.is_muted)
            })
            .map(|((_, user), _)| user.clone())
            .collect()
    }

    /// Credit one user's elapsed active time: pair ledger entries against
    /// each partner, exp, and play time, then milestone dispatch.
    pub(crate) async fn apply_settlement(
        &mut self,
        community_id: &str,
        channel_id: &str,
        user_id: &str,
        partners: &[String],
        elapsed_secs: i64,
        now_ms: i64,
    ) -> Result<()> {
        if elapsed_secs <= 0 {
            return Ok(());
        }

        if !partners.is_empty() {
            let mut deltas = Vec::with_capacity(partners.len());
            for partner in partners {
                deltas.push(PairDelta {
                    pair: PairKey::new(user_id, partner.as_str())?,
                    delta_secs: elapsed_secs,
                });
            }
            let outcomes = self
                .store
                .batch_update_relationships(community_id, &deltas, now_ms)?;
            self.dispatch_milestones(community_id, channel_id, &outcomes, now_ms)
                .await;
        }

        let amount = exp_for_interval(elapsed_secs, partners.len(), &self.config.leveling);
        self.grant_exp(community_id, user_id, amount, now_ms)?;
        self.store.add_play_time(community_id, user_id, elapsed_secs)?;
        Ok(())
    }

    /// Grant exp under the daily cap and log level-ups.
    pub(crate) fn grant_exp(
        &self,
        community_id: &str,
        user_id: &str,
        amount: i64,
        now_ms: i64,
    ) -> Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        let leveling = &self.config.leveling;
        let cap = (leveling.daily_exp_cap > 0).then(|| ExpCap {
            limit: leveling.daily_exp_cap,
            since_ms: leveling.cap_window.window_start_ms(now_ms),
        });
        let outcome = self
            .store
            .add_exp_and_check_levelup(community_id, user_id, amount, now_ms, cap)?;
        if outcome.leveled_up {
            info!(
                community_id = %community_id,
                user_id = %user_id,
                old_level = outcome.old_level,
                new_level = outcome.new_level,
                total_exp = outcome.total_exp,
                "User leveled up"
            );
        }
        Ok(())
    }

    /// Report every milestone threshold crossed by a ledger batch.
    pub(crate) async fn dispatch_milestones(
        &mut self,
        community_id: &str,
        channel_id: &str,
        outcomes: &[PairOutcome],
        now_ms: i64,
    ) {
        let thresholds = self.config.milestone_thresholds_secs();
        for outcome in outcomes {
            for threshold in crossed_thresholds(outcome.prev_secs, outcome.new_secs, &thresholds) {
                let hours = (threshold / 3600) as u32;
                self.notifier
                    .on_pair_milestone(
                        community_id,
                        channel_id,
                        &outcome.pair,
                        hours,
                        outcome.new_secs,
                        now_ms,
                    )
                    .await;
            }
        }
    }
}
