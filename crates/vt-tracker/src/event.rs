//! Voice event types and the seams the tracker depends on.
//!
//! Gateway callbacks are modeled as explicit event values dispatched over a
//! bounded channel, so the core logic is testable without a live connection.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A member of a community, reduced to what the tracker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_bot: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_bot: false,
        }
    }
}

/// A participant currently observed in a voice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePresence {
    pub member: Participant,
    pub is_muted: bool,
}

/// Lifecycle events delivered by the platform gateway.
///
/// `at` timestamps are epoch milliseconds assigned at event origin.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Join {
        community_id: String,
        channel_id: String,
        member: Participant,
        is_muted: bool,
        at: i64,
    },
    Leave {
        community_id: String,
        channel_id: String,
        member: Participant,
        at: i64,
    },
    Move {
        community_id: String,
        from_channel_id: String,
        to_channel_id: String,
        member: Participant,
        is_muted: bool,
        at: i64,
    },
    MuteChange {
        community_id: String,
        member: Participant,
        /// Prior state as the gateway saw it. Advisory only: the tracked
        /// session is authoritative, a mismatch is logged and ignored.
        was_muted: bool,
        now_muted: bool,
        at: i64,
    },
}

impl VoiceEvent {
    pub fn community_id(&self) -> &str {
        match self {
            Self::Join { community_id, .. }
            | Self::Leave { community_id, .. }
            | Self::Move { community_id, .. }
            | Self::MuteChange { community_id, .. } => community_id,
        }
    }

    pub fn member(&self) -> &Participant {
        match self {
            Self::Join { member, .. }
            | Self::Leave { member, .. }
            | Self::Move { member, .. }
            | Self::MuteChange { member, .. } => member,
        }
    }
}

/// Create the bounded channel voice events are dispatched over.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<VoiceEvent>, mpsc::Receiver<VoiceEvent>) {
    mpsc::channel(capacity)
}

/// Snapshot view of current voice presence, supplied by the platform gateway.
///
/// The reconciliation loop and startup recovery read world state through this
/// trait; tests supply a fake.
pub trait PresenceGateway: Send + Sync {
    /// Voice channel ids for a community
    fn voice_channels(&self, community_id: &str) -> Vec<String>;

    /// Users currently present in a channel
    fn users_in_channel(&self, community_id: &str, channel_id: &str) -> Vec<VoicePresence>;
}

/// Time source. Production uses [`SystemClock`]; tests drive a manual clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock time via chrono
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
