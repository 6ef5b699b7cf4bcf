//! Pure elapsed-time arithmetic for session settlement.
//!
//! Kept free of store calls so the mute-aware window math is unit-testable
//! on its own; the side-effecting half lives in
//! [`lifecycle`](super::lifecycle).

use super::ActiveSession;

/// Unsettled active seconds for a session at `now_ms`.
///
/// Gross time since the settled marker, minus the overlap of an open mute
/// stretch with that window when mute filtering is on. Completed mute
/// stretches never appear here: settlement on unmute always advances the
/// marker past them.
pub(crate) fn elapsed_since_marker(
    session: &ActiveSession,
    now_ms: i64,
    ignore_muted: bool,
) -> i64 {
    let gross = ((now_ms - session.settled_marker_at) / 1000).max(0);
    if !ignore_muted || !session.is_muted {
        return gross;
    }
    let Some(marker) = session.mute_marker_at else {
        return gross;
    };
    let overlap_from = marker.max(session.settled_marker_at);
    let muted = ((now_ms - overlap_from) / 1000).max(0);
    (gross - muted).max(0)
}

/// Advance the settled marker; everything before `now_ms` is credited.
pub(crate) fn advance_marker(session: &mut ActiveSession, now_ms: i64) {
    if now_ms > session.settled_marker_at {
        session.settled_marker_at = now_ms;
    }
}
