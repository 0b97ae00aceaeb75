//! In-memory tracker for in-flight voice calls (spec §4.7 C7): bridges the
//! external SIP/ARI control plane's events onto a request id, the way
//! `voice-switch`'s carrier cache bridges carrier rows onto a `DashMap` for
//! lock-free concurrent access.
//!
//! Attributes ring/talk durations and hangup cause (`user` vs `system`) to
//! the terminal voice event. Registered, not computed from timestamps
//! stored elsewhere, because voice events can arrive from either the
//! application control channel or the low-level SIP manager (spec §9
//! "cross-channel event correlation") and only the tracker has seen both.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Dialing,
    Answered,
    Playing,
    Completed,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupCause {
    User,
    System,
}

#[derive(Debug, Clone)]
pub struct CallState {
    pub request_id: Uuid,
    pub channel_id: Option<String>,
    pub caller_id: Option<String>,
    pub phase: CallPhase,
    pub registered_at: Instant,
    pub answered_at: Option<Instant>,
    pub otp_played: bool,
    pub system_hangup: bool,
}

/// Ring and talk durations plus the attributed hangup cause, returned when
/// a call ends (spec §4.7: "attribute... durations to the terminal event").
#[derive(Debug, Clone, Copy)]
pub struct CallDurations {
    pub ring_duration: Duration,
    pub talk_duration: Duration,
    pub hangup_cause: HangupCause,
}

/// Tracks exactly one active call per request id. A request only ever has
/// one outstanding voice attempt at a time (sequential channel failover,
/// spec §4.6), so this is a flat map rather than a multimap.
#[derive(Clone)]
pub struct CallTracker {
    calls: Arc<DashMap<Uuid, CallState>>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }

    pub fn register_call(&self, request_id: Uuid, caller_id: Option<String>) {
        self.calls.insert(
            request_id,
            CallState {
                request_id,
                channel_id: None,
                caller_id,
                phase: CallPhase::Dialing,
                registered_at: Instant::now(),
                answered_at: None,
                otp_played: false,
                system_hangup: false,
            },
        );
    }

    pub fn set_channel_id(&self, request_id: Uuid, channel_id: String) {
        if let Some(mut call) = self.calls.get_mut(&request_id) {
            call.channel_id = Some(channel_id);
        }
    }

    /// Records the answer timestamp and returns the ring duration (time
    /// from registration to answer) so callers can log/emit it immediately.
    pub fn mark_answered(&self, request_id: Uuid) -> Option<Duration> {
        let mut call = self.calls.get_mut(&request_id)?;
        let now = Instant::now();
        call.phase = CallPhase::Answered;
        call.answered_at = Some(now);
        Some(now.saturating_duration_since(call.registered_at))
    }

    pub fn mark_otp_played(&self, request_id: Uuid) {
        if let Some(mut call) = self.calls.get_mut(&request_id) {
            call.phase = CallPhase::Playing;
            call.otp_played = true;
        }
    }

    pub fn mark_completed(&self, request_id: Uuid) {
        if let Some(mut call) = self.calls.get_mut(&request_id) {
            call.phase = CallPhase::Completed;
        }
    }

    /// Tags the call as ended by the system (e.g. after the OTP finished
    /// playing) rather than by the far end hanging up first. Must be called
    /// before `end_call` to affect the reported hangup cause.
    pub fn mark_system_hangup(&self, request_id: Uuid) {
        if let Some(mut call) = self.calls.get_mut(&request_id) {
            call.system_hangup = true;
        }
    }

    /// End of call, whether clean hangup or provider-side failure. Removes
    /// the tracked state so the map doesn't grow unbounded and returns the
    /// ring/talk durations plus who hung up.
    pub fn end_call(&self, request_id: Uuid) -> Option<CallDurations> {
        let (_, state) = self.calls.remove(&request_id)?;
        let now = Instant::now();
        let ring_duration = state
            .answered_at
            .unwrap_or(now)
            .saturating_duration_since(state.registered_at);
        let talk_duration = state
            .answered_at
            .map(|answered| now.saturating_duration_since(answered))
            .unwrap_or_default();
        let hangup_cause = if state.system_hangup {
            HangupCause::System
        } else {
            HangupCause::User
        };
        Some(CallDurations {
            ring_duration,
            talk_duration,
            hangup_cause,
        })
    }

    pub fn get(&self, request_id: Uuid) -> Option<CallState> {
        self.calls.get(&request_id).map(|r| r.clone())
    }

    /// Reverse lookup for ARI events, which identify a call by the
    /// provider's own channel id rather than the request id. The active-call
    /// set is small (one entry per in-flight voice attempt), so a scan is
    /// cheaper than maintaining a second index.
    pub fn find_by_channel_id(&self, channel_id: &str) -> Option<Uuid> {
        self.calls
            .iter()
            .find(|entry| entry.value().channel_id.as_deref() == Some(channel_id))
            .map(|entry| *entry.key())
    }

    pub fn active_count(&self) -> usize {
        self.calls.len()
    }
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_and_cleans_up() {
        let tracker = CallTracker::new();
        let id = Uuid::new_v4();
        tracker.register_call(id, Some("+14155550000".to_string()));
        assert_eq!(tracker.active_count(), 1);

        tracker.set_channel_id(id, "PJSIP/1234-0000001".to_string());
        let ring = tracker.mark_answered(id);
        assert!(ring.is_some());
        assert_eq!(tracker.get(id).unwrap().phase, CallPhase::Answered);

        tracker.mark_otp_played(id);
        assert_eq!(tracker.get(id).unwrap().phase, CallPhase::Playing);
        assert!(tracker.get(id).unwrap().otp_played);

        let durations = tracker.end_call(id).unwrap();
        assert_eq!(durations.hangup_cause, HangupCause::User);
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.get(id).is_none());
    }

    #[test]
    fn system_hangup_is_attributed_correctly() {
        let tracker = CallTracker::new();
        let id = Uuid::new_v4();
        tracker.register_call(id, None);
        tracker.mark_answered(id);
        tracker.mark_otp_played(id);
        tracker.mark_system_hangup(id);

        let durations = tracker.end_call(id).unwrap();
        assert_eq!(durations.hangup_cause, HangupCause::System);
    }

    #[test]
    fn unanswered_call_has_zero_talk_duration() {
        let tracker = CallTracker::new();
        let id = Uuid::new_v4();
        tracker.register_call(id, None);
        let durations = tracker.end_call(id).unwrap();
        assert_eq!(durations.talk_duration, Duration::ZERO);
    }

    #[test]
    fn unknown_request_mutations_are_no_ops() {
        let tracker = CallTracker::new();
        let id = Uuid::new_v4();
        assert!(tracker.mark_answered(id).is_none());
        assert!(tracker.get(id).is_none());
    }
}
