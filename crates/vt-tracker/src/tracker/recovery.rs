//! Startup recovery.
//!
//! Neither the gateway's world state nor the last persisted state is
//! authoritative on its own; both are reconciled. A user still present with
//! a dangling open session gets it re-adopted; a user the store never heard
//! of (or who changed channels while we were down) gets a fresh session.

use tracing::{debug, info};

use vt_core::Result;
use vt_core::db::NewSession;

use super::{ActiveSession, VoiceTracker};

impl VoiceTracker {
    /// Rebuild the in-memory session index from gateway + store state.
    pub async fn recover(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        let mut adopted = 0u32;
        let mut created = 0u32;

        let communities = self.config.tracking.enabled_communities.clone();
        for community_id in &communities {
            for channel_id in self.gateway.voice_channels(community_id) {
                for presence in self.gateway.users_in_channel(community_id, &channel_id) {
                    if presence.member.is_bot {
                        continue;
                    }
                    let key: super::SessionKey =
                        (community_id.clone(), presence.member.id.clone());
                    if self.sessions.contains_key(&key) {
                        continue;
                    }

                    let row = self
                        .store
                        .get_active_session(community_id, &presence.member.id)?;

                    match row {
                        Some(row) if row.channel_id == channel_id => {
                            // Dangling open session: adopt it. Accounting
                            // restarts at `now` so the downtime gap is never
                            // credited or double counted.
                            self.store.advance_settled_marker(&row.id, now)?;
                            if row.is_muted != presence.is_muted {
                                self.store.update_session_mute(
                                    &row.id,
                                    presence.is_muted,
                                    0,
                                    presence.is_muted.then_some(now),
                                )?;
                            }

                            let mut session =
                                ActiveSession::from_row(&row, presence.member.clone());
                            session.settled_marker_at = now;
                            session.is_muted = presence.is_muted;
                            session.mute_marker_at = if presence.is_muted {
                                // Keep the persisted stretch start when the
                                // mute carried across the restart.
                                if row.is_muted { row.mute_marker_at } else { None }
                                    .or(Some(now))
                            } else {
                                None
                            };

                            debug!(
                                community_id = %community_id,
                                user_id = %presence.member.id,
                                session_id = %session.session_id,
                                "Adopted persisted voice session"
                            );
                            self.sessions.insert(key, session);
                            adopted += 1;
                        }
                        other => {
                            // Moved channels while down, or nothing persisted:
                            // close any stale row and start fresh.
                            if let Some(stale) = other {
                                self.store.end_session(&stale.id, now)?;
                            }
                            let session_id = self.store.create_session(&NewSession {
                                community_id: community_id.clone(),
                                user_id: presence.member.id.clone(),
                                channel_id: channel_id.clone(),
                                started_at: now,
                                is_muted: presence.is_muted,
                            })?;
                            self.sessions.insert(
                                key,
                                ActiveSession {
                                    session_id,
                                    channel_id: channel_id.clone(),
                                    member: presence.member.clone(),
                                    settled_marker_at: now,
                                    is_muted: presence.is_muted,
                                    mute_marker_at: presence.is_muted.then_some(now),
                                },
                            );
                            created += 1;
                        }
                    }
                }
            }
        }

        info!(adopted, created, "Voice session recovery complete");
        Ok(())
    }
}
