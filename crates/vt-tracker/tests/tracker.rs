//! End-to-end tracker tests against an in-memory store, a fake gateway,
//! a manual clock, and a recording notification sink.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use vt_core::config::{MilestoneConfig, TrackerConfig};
use vt_core::{Result, Store};
use vt_tracker::event::event_channel;
use vt_tracker::{
    Clock, MessageRef, NotificationSink, Participant, PresenceGateway, VoiceEvent, VoicePresence,
    VoiceTracker,
};

const MINUTE_MS: i64 = 60_000;

struct ManualClock(AtomicI64);

impl ManualClock {
    fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeGateway {
    channels: Mutex<HashMap<(String, String), Vec<VoicePresence>>>,
}

impl FakeGateway {
    fn put(&self, community_id: &str, channel_id: &str, users: Vec<VoicePresence>) {
        self.channels
            .lock()
            .unwrap()
            .insert((community_id.to_string(), channel_id.to_string()), users);
    }
}

impl PresenceGateway for FakeGateway {
    fn voice_channels(&self, community_id: &str) -> Vec<String> {
        self.channels
            .lock()
            .unwrap()
            .keys()
            .filter(|(community, _)| community == community_id)
            .map(|(_, channel)| channel.clone())
            .collect()
    }

    fn users_in_channel(&self, community_id: &str, channel_id: &str) -> Vec<VoicePresence> {
        self.channels
            .lock()
            .unwrap()
            .get(&(community_id.to_string(), channel_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct RecordingSink {
    notifies: Mutex<Vec<(u32, Vec<String>)>>,
    appends: Mutex<Vec<String>>,
    specials: Mutex<Vec<(String, String, u32)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(
        &self,
        _community_id: &str,
        channel_id: &str,
        milestone_hours: u32,
        participants: &[String],
    ) -> Result<MessageRef> {
        let mut notifies = self.notifies.lock().unwrap();
        notifies.push((milestone_hours, participants.to_vec()));
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            message_id: format!("m{}", notifies.len()),
        })
    }

    async fn append_to(&self, _message: &MessageRef, participant: &str) -> Result<()> {
        self.appends.lock().unwrap().push(participant.to_string());
        Ok(())
    }

    async fn notify_special(
        &self,
        _community_id: &str,
        user_a: &str,
        user_b: &str,
        milestone_hours: u32,
        _cumulative_hours: f64,
    ) -> Result<()> {
        self.specials.lock().unwrap().push((
            user_a.to_string(),
            user_b.to_string(),
            milestone_hours,
        ));
        Ok(())
    }
}

struct Fixture {
    store: Arc<Store>,
    gateway: Arc<FakeGateway>,
    clock: Arc<ManualClock>,
    sink: Arc<RecordingSink>,
    tracker: VoiceTracker,
}

fn config(communities: &[&str]) -> TrackerConfig {
    let mut config = TrackerConfig::default();
    config.tracking.enabled_communities = communities.iter().map(|c| c.to_string()).collect();
    // Quiet milestones unless a test opts in
    config.milestones = MilestoneConfig {
        relationship_hours: vec![],
        rare_hours: vec![],
    };
    config
}

fn fixture(config: TrackerConfig) -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let gateway = Arc::new(FakeGateway::default());
    let clock = Arc::new(ManualClock::new());
    let sink = Arc::new(RecordingSink::default());
    let tracker = VoiceTracker::with_clock(
        store.clone(),
        gateway.clone(),
        sink.clone(),
        config,
        clock.clone(),
    );
    Fixture {
        store,
        gateway,
        clock,
        sink,
        tracker,
    }
}

fn restart(f: &Fixture, config: TrackerConfig) -> VoiceTracker {
    VoiceTracker::with_clock(
        f.store.clone(),
        f.gateway.clone(),
        f.sink.clone(),
        config,
        f.clock.clone(),
    )
}

fn member(id: &str) -> Participant {
    Participant::new(id, id)
}

fn presence(id: &str) -> VoicePresence {
    VoicePresence {
        member: member(id),
        is_muted: false,
    }
}

#[tokio::test]
async fn test_solo_user_accrues_no_relationships() {
    let mut f = fixture(config(&["g1"]));
    f.gateway.put("g1", "c1", vec![presence("a")]);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();

    for tick in 1..=65 {
        f.clock.set(tick * MINUTE_MS);
        f.tracker.reconcile_all().await;
    }

    let level = f.store.get_user_level("g1", "a").unwrap().unwrap();
    assert_eq!(level.unique_partners, 0);
    // Default solo policy grants no exp, but play time still accrues
    assert_eq!(level.total_exp, 0);
    assert_eq!(level.total_play_time_secs, 65 * 60);

    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert!(session.is_solo);
    assert!(!session.has_partners);
}

#[tokio::test]
async fn test_solo_reduced_exp_rate() {
    let mut cfg = config(&["g1"]);
    cfg.leveling.solo_exp_per_minute = 5;
    let mut f = fixture(cfg);
    f.gateway.put("g1", "c1", vec![presence("a")]);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();

    for tick in 1..=3 {
        f.clock.set(tick * MINUTE_MS);
        f.tracker.reconcile_all().await;
    }

    let level = f.store.get_user_level("g1", "a").unwrap().unwrap();
    assert_eq!(level.total_exp, 15);
}

#[tokio::test]
async fn test_lone_muted_occupant_still_marked_solo() {
    let mut f = fixture(config(&["g1"]));
    f.gateway.put(
        "g1",
        "c1",
        vec![VoicePresence {
            member: member("a"),
            is_muted: true,
        }],
    );
    f.tracker.on_join("g1", "c1", &member("a"), true, 0).await.unwrap();

    f.clock.set(MINUTE_MS);
    f.tracker.reconcile_all().await;

    // Mute filtering excludes the user from accrual, not from solo marking
    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert!(session.is_solo);
    assert!(!session.has_partners);
    assert!(f.store.get_user_level("g1", "a").unwrap().is_none());
}

#[tokio::test]
async fn test_mute_filtering_credits_five_of_ten_minutes() {
    let mut f = fixture(config(&["g1"]));
    f.gateway.put("g1", "c1", vec![presence("a"), presence("b")]);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();

    for minute in 1..=10 {
        f.clock.set(minute * MINUTE_MS);
        f.tracker.reconcile_all().await;
        if minute == 2 {
            f.tracker
                .on_mute_change("g1", &member("b"), true, 2 * MINUTE_MS)
                .await
                .unwrap();
        }
        if minute == 7 {
            f.tracker
                .on_mute_change("g1", &member("b"), false, 7 * MINUTE_MS)
                .await
                .unwrap();
        }
    }

    f.tracker
        .on_leave("g1", "c1", &member("a"), 10 * MINUTE_MS)
        .await
        .unwrap();
    f.tracker
        .on_leave("g1", "c1", &member("b"), 10 * MINUTE_MS)
        .await
        .unwrap();

    // Muted minutes 2..7 never reach the ledger
    let rel = f.store.get_relationship("g1", "a", "b").unwrap().unwrap();
    assert_eq!(rel.total_time_secs, 300);

    // B's closed session satisfies the duration identity
    let sessions_b = f.store.get_active_session("g1", "b").unwrap();
    assert!(sessions_b.is_none());
}

#[tokio::test]
async fn test_three_users_three_pairs_from_batched_cycles() {
    let mut f = fixture(config(&["g1"]));
    f.gateway
        .put("g1", "c1", vec![presence("a"), presence("b"), presence("c")]);
    for user in ["a", "b", "c"] {
        f.tracker.on_join("g1", "c1", &member(user), false, 0).await.unwrap();
    }

    for tick in 1..=60 {
        f.clock.set(tick * MINUTE_MS);
        f.tracker.reconcile_all().await;
    }

    for (x, y) in [("a", "b"), ("a", "c"), ("b", "c")] {
        let rel = f.store.get_relationship("g1", x, y).unwrap().unwrap();
        assert_eq!(rel.total_time_secs, 3600, "pair ({x}, {y})");
    }
    for user in ["a", "b", "c"] {
        let level = f.store.get_user_level("g1", user).unwrap().unwrap();
        assert_eq!(level.unique_partners, 2);
        let session = f.store.get_active_session("g1", user).unwrap().unwrap();
        assert!(session.has_partners);
        assert!(!session.is_solo);
    }
}

#[tokio::test]
async fn test_relationship_symmetry_through_tracker() {
    let mut f = fixture(config(&["g1"]));
    f.gateway.put("g1", "c1", vec![presence("a"), presence("b")]);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();
    f.clock.set(MINUTE_MS);
    f.tracker.reconcile_all().await;

    let ab = f.store.get_relationship("g1", "a", "b").unwrap().unwrap();
    let ba = f.store.get_relationship("g1", "b", "a").unwrap().unwrap();
    assert_eq!(ab.total_time_secs, ba.total_time_secs);
    assert_eq!(ab.pair, ba.pair);
}

#[tokio::test]
async fn test_move_settles_old_channel_immediately() {
    let mut f = fixture(config(&["g1"]));
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();

    // No tick has fired; the move alone settles five minutes
    f.tracker
        .on_move("g1", "c1", "c2", &member("a"), false, 5 * MINUTE_MS)
        .await
        .unwrap();

    let rel = f.store.get_relationship("g1", "a", "b").unwrap().unwrap();
    assert_eq!(rel.total_time_secs, 300);

    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert_eq!(session.channel_id, "c2");
    assert_eq!(session.started_at, 5 * MINUTE_MS);
}

#[tokio::test]
async fn test_two_milestones_crossed_in_one_settlement() {
    let mut cfg = config(&["g1"]);
    cfg.milestones = MilestoneConfig {
        relationship_hours: vec![1, 2],
        rare_hours: vec![],
    };
    let mut f = fixture(cfg);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();

    // One settlement spanning both the 1h and 2h thresholds
    let leave_at = 2 * 3_600_000 + MINUTE_MS;
    f.clock.set(leave_at);
    f.tracker.on_leave("g1", "c1", &member("a"), leave_at).await.unwrap();

    f.clock.set(leave_at + 31_000);
    f.tracker.sweep_notifications().await;

    let notifies = f.sink.notifies.lock().unwrap();
    let mut hours: Vec<u32> = notifies.iter().map(|(h, _)| *h).collect();
    hours.sort_unstable();
    assert_eq!(hours, vec![1, 2], "both thresholds reported, not only one");
}

#[tokio::test]
async fn test_rare_milestone_delivered_individually() {
    let mut cfg = config(&["g1"]);
    cfg.milestones = MilestoneConfig {
        relationship_hours: vec![1],
        rare_hours: vec![1],
    };
    let mut f = fixture(cfg);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();

    let leave_at = 3_600_000 + MINUTE_MS;
    f.clock.set(leave_at);
    f.tracker.on_leave("g1", "c1", &member("b"), leave_at).await.unwrap();

    // No sweep needed: rare tiers bypass batching
    let specials = f.sink.specials.lock().unwrap();
    assert_eq!(specials.len(), 1);
    assert_eq!(specials[0].2, 1);
    assert!(f.sink.notifies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_mute_event_trusts_tracked_state_over_gateway() {
    let mut f = fixture(config(&["g1"]));
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();

    // The gateway's prior-state claim is stale; the transition still applies
    f.tracker
        .handle_event(VoiceEvent::MuteChange {
            community_id: "g1".to_string(),
            member: member("a"),
            was_muted: true,
            now_muted: true,
            at: MINUTE_MS,
        })
        .await;
    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert!(session.is_muted);
    assert_eq!(session.mute_marker_at, Some(MINUTE_MS));

    f.tracker
        .handle_event(VoiceEvent::MuteChange {
            community_id: "g1".to_string(),
            member: member("a"),
            was_muted: false,
            now_muted: false,
            at: 2 * MINUTE_MS,
        })
        .await;
    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert!(!session.is_muted);
    assert_eq!(session.muted_duration_secs, 60);
}

#[tokio::test]
async fn test_restart_readopts_dangling_sessions() {
    let cfg = config(&["g1"]);
    let mut f = fixture(cfg.clone());
    f.gateway.put("g1", "c1", vec![presence("a"), presence("b")]);
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();
    f.clock.set(MINUTE_MS);
    f.tracker.reconcile_all().await;

    let id_a = f.store.get_active_session("g1", "a").unwrap().unwrap().id;
    let id_b = f.store.get_active_session("g1", "b").unwrap().unwrap().id;

    // Process restarts with both users still co-present
    f.clock.set(90_000);
    let mut tracker = restart(&f, cfg);
    assert_eq!(tracker.tracked_count(), 0);
    tracker.recover().await.unwrap();
    assert_eq!(tracker.tracked_count(), 2);

    // Same persisted sessions, not duplicates
    assert_eq!(f.store.get_active_session("g1", "a").unwrap().unwrap().id, id_a);
    assert_eq!(f.store.get_active_session("g1", "b").unwrap().unwrap().id, id_b);

    // Subsequent reconciliation stays additive: no negative or doubled time
    f.clock.set(150_000);
    tracker.reconcile_all().await;
    let rel = f.store.get_relationship("g1", "a", "b").unwrap().unwrap();
    assert_eq!(rel.total_time_secs, 120);
}

#[tokio::test]
async fn test_recovery_creates_sessions_for_unknown_users() {
    let cfg = config(&["g1"]);
    let f = fixture(cfg.clone());
    f.gateway.put("g1", "c1", vec![presence("c")]);
    f.clock.set(10_000);

    let mut tracker = restart(&f, cfg);
    tracker.recover().await.unwrap();

    assert_eq!(tracker.tracked_count(), 1);
    let session = f.store.get_active_session("g1", "c").unwrap().unwrap();
    assert_eq!(session.started_at, 10_000);
}

#[tokio::test]
async fn test_recovery_closes_session_after_channel_move() {
    let cfg = config(&["g1"]);
    let mut f = fixture(cfg.clone());
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    let old_id = f.store.get_active_session("g1", "a").unwrap().unwrap().id;

    // While down, the user moved to another channel
    f.gateway.put("g1", "c2", vec![presence("a")]);
    f.clock.set(120_000);
    let mut tracker = restart(&f, cfg);
    tracker.recover().await.unwrap();

    let old = f.store.get_session(&old_id).unwrap().unwrap();
    assert!(!old.is_open());
    let session = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert_eq!(session.channel_id, "c2");
    assert_ne!(session.id, old_id);
}

#[tokio::test]
async fn test_leave_falls_back_to_store_after_restart() {
    let cfg = config(&["g1"]);
    let mut f = fixture(cfg.clone());
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();

    // Cold index: the leave still resolves and closes the persisted session
    let mut tracker = restart(&f, cfg);
    tracker.on_leave("g1", "c1", &member("a"), 90_000).await.unwrap();
    assert!(f.store.get_active_session("g1", "a").unwrap().is_none());
}

#[tokio::test]
async fn test_leave_without_session_is_a_noop() {
    let mut f = fixture(config(&["g1"]));
    let result = f.tracker.on_leave("g1", "c1", &member("ghost"), 1000).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bots_are_never_tracked() {
    let mut f = fixture(config(&["g1"]));
    let bot = Participant {
        id: "bot1".to_string(),
        display_name: "Bot".to_string(),
        is_bot: true,
    };
    f.tracker.on_join("g1", "c1", &bot, false, 0).await.unwrap();
    assert_eq!(f.tracker.tracked_count(), 0);

    f.gateway.put(
        "g1",
        "c1",
        vec![VoicePresence {
            member: bot,
            is_muted: false,
        }],
    );
    f.tracker.recover().await.unwrap();
    assert_eq!(f.tracker.tracked_count(), 0);
}

#[tokio::test]
async fn test_disabled_community_short_circuits() {
    let mut f = fixture(config(&["g1"]));
    f.tracker.on_join("g2", "c1", &member("a"), false, 0).await.unwrap();
    assert_eq!(f.tracker.tracked_count(), 0);
    assert!(f.store.get_active_session("g2", "a").unwrap().is_none());
}

#[tokio::test]
async fn test_sub_minimum_sessions_still_recorded() {
    let mut f = fixture(config(&["g1"]));
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    f.tracker.on_join("g1", "c1", &member("b"), false, 0).await.unwrap();
    f.tracker.on_leave("g1", "c1", &member("a"), 30_000).await.unwrap();

    // Below the display threshold, but the raw time is recorded regardless
    let rel = f.store.get_relationship("g1", "a", "b").unwrap().unwrap();
    assert_eq!(rel.total_time_secs, 30);
}

#[tokio::test]
async fn test_rejoin_without_leave_closes_stale_session() {
    let mut f = fixture(config(&["g1"]));
    f.tracker.on_join("g1", "c1", &member("a"), false, 0).await.unwrap();
    let first = f.store.get_active_session("g1", "a").unwrap().unwrap().id;

    f.tracker.on_join("g1", "c2", &member("a"), false, 60_000).await.unwrap();
    assert_eq!(f.tracker.tracked_count(), 1);

    let old = f.store.get_session(&first).unwrap().unwrap();
    assert!(!old.is_open());
    let current = f.store.get_active_session("g1", "a").unwrap().unwrap();
    assert_eq!(current.channel_id, "c2");
}

#[tokio::test]
async fn test_run_loop_processes_events_and_stops_cleanly() {
    let f = fixture(config(&["g1"]));
    let store = f.store.clone();
    let (events_tx, events_rx) = event_channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(f.tracker.run(events_rx, shutdown_rx));

    events_tx
        .send(VoiceEvent::Join {
            community_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            member: member("a"),
            is_muted: false,
            at: 1000,
        })
        .await
        .unwrap();

    // Wait for the loop to absorb the event
    for _ in 0..200 {
        if store.get_active_session("g1", "a").unwrap().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(store.get_active_session("g1", "a").unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
