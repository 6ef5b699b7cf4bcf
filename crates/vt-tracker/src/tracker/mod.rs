//! The voice level tracker engine.
//!
//! One task owns the in-memory session index and drives lifecycle events,
//! the reconciliation tick, and notification sweeps through a single
//! `select!` loop. Events and ticks interleave but never run concurrently
//! against the index, so it needs no locking; only the store's connection
//! guards itself.

pub mod lifecycle;
pub mod reconcile;
pub mod recovery;
pub mod settle;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info};

use vt_core::db::VoiceSession;
use vt_core::{Store, TrackerConfig};

use crate::event::{Clock, Participant, PresenceGateway, SystemClock, VoiceEvent};
use crate::notify::{NotificationDispatcher, NotificationSink};

/// In-memory view of an open session, owned by the tracker task.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub(crate) session_id: String,
    pub(crate) channel_id: String,
    pub(crate) member: Participant,
    /// Time up to which this session's active time has been credited
    pub(crate) settled_marker_at: i64,
    pub(crate) is_muted: bool,
    /// When the current mute stretch began, if muted
    pub(crate) mute_marker_at: Option<i64>,
}

impl ActiveSession {
    pub(crate) fn from_row(row: &VoiceSession, member: Participant) -> Self {
        Self {
            session_id: row.id.clone(),
            channel_id: row.channel_id.clone(),
            member,
            settled_marker_at: row.settled_marker_at,
            is_muted: row.is_muted,
            mute_marker_at: row.mute_marker_at,
        }
    }
}

/// Index key: (community_id, user_id)
pub(crate) type SessionKey = (String, String);

/// Tracks voice co-presence, converts it to exp/levels, and dispatches
/// milestone notifications.
pub struct VoiceTracker {
    pub(crate) store: Arc<Store>,
    pub(crate) gateway: Arc<dyn PresenceGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<TrackerConfig>,
    pub(crate) sessions: HashMap<SessionKey, ActiveSession>,
    pub(crate) notifier: NotificationDispatcher,
}

impl VoiceTracker {
    /// Create a tracker with the system clock.
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PresenceGateway>,
        sink: Arc<dyn NotificationSink>,
        config: TrackerConfig,
    ) -> Self {
        Self::with_clock(store, gateway, sink, config, Arc::new(SystemClock))
    }

    /// Create a tracker with an explicit clock (tests drive a manual one).
    pub fn with_clock(
        store: Arc<Store>,
        gateway: Arc<dyn PresenceGateway>,
        sink: Arc<dyn NotificationSink>,
        config: TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let notifier = NotificationDispatcher::new(
            sink,
            config.milestones.clone(),
            config.notifications.clone(),
        );
        Self {
            store,
            gateway,
            clock,
            config: Arc::new(config),
            sessions: HashMap::new(),
            notifier,
        }
    }

    /// Number of sessions currently held in the in-memory index
    pub fn tracked_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run notification window maintenance at the current time
    pub async fn sweep_notifications(&mut self) {
        let now = self.clock.now_ms();
        self.notifier.sweep(now).await;
    }

    /// Drive the tracker until shutdown is signalled or the event channel
    /// closes.
    ///
    /// Startup recovery runs first, then the loop serializes lifecycle
    /// events, reconciliation ticks, and notification sweeps. On shutdown the
    /// in-flight step completes before the timer stops; nothing is cancelled
    /// mid-settlement.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<VoiceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "Voice session recovery failed");
        }

        let tick_secs = self.config.tracking.reconcile_interval_secs;
        let mut tick = interval(Duration::from_secs(tick_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = tick_secs, "Voice tracker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick.tick() => {
                    self.reconcile_all().await;
                    self.sweep_notifications().await;
                }
            }
        }

        info!("Voice tracker stopped");
    }
}
