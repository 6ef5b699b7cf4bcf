//! vt-tracker - Voice co-presence tracking engine
//!
//! Tracks how long pairs of users spend together in voice channels, converts
//! accumulated co-presence into experience and levels, and emits spam-limited
//! milestone notifications.
//!
//! - **event**: explicit voice event types, gateway and clock seams
//! - **tracker**: session lifecycle, settlement, reconciliation, recovery
//! - **notify**: milestone batching, deduplication, and delivery

pub mod event;
pub mod notify;
pub mod tracker;

// Re-export commonly used types
pub use event::{Clock, Participant, PresenceGateway, SystemClock, VoiceEvent, VoicePresence};
pub use notify::{MessageRef, NotificationSink};
pub use tracker::VoiceTracker;
