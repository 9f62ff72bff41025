//! Property-based tests for the stall detector and the output parsers.

use chrono::{DateTime, Duration, TimeZone, Utc};
use netboot_iscsi::{
    parse::{parse_socket_table, parse_target_listing},
    transition, Confidence, Observation, StallConfig, StallEvent, StallState, StallTracker,
};
use proptest::prelude::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn any_confidence() -> impl Strategy<Value = Confidence> {
    prop_oneof![
        Just(Confidence::High),
        Just(Confidence::Medium),
        Just(Confidence::Ambiguous),
        Just(Confidence::Unknown)
    ]
}

/// One poll: (seconds since previous, active, confidence, total)
fn any_poll() -> impl Strategy<Value = (i64, bool, Confidence, Option<u64>)> {
    (
        0i64..400,
        any::<bool>(),
        any_confidence(),
        proptest::option::of(0u64..10_000),
    )
}

proptest! {
    /// Untrusted polls of an active session always land in active_unattributed
    /// and never emit events.
    #[test]
    fn test_untrusted_polls_never_log(
        polls in proptest::collection::vec((0i64..400, 0u64..10_000), 1..30),
        start_total in 0u64..10_000,
    ) {
        let config = StallConfig::default();
        let mut tracker = StallTracker::default();
        let mut at = t0();
        let first = transition(&tracker, &Observation {
            active: true,
            confidence: Confidence::High,
            total_bytes: Some(start_total),
            at,
        }, &config);
        tracker = first.tracker;

        for (gap, total) in polls {
            at += Duration::seconds(gap);
            let out = transition(&tracker, &Observation {
                active: true,
                confidence: Confidence::Ambiguous,
                total_bytes: Some(total),
                at,
            }, &config);
            prop_assert_eq!(out.tracker.stall_state, StallState::ActiveUnattributed);
            prop_assert!(out.events.is_empty());
            prop_assert_eq!(out.tracker.stall_last_total_bytes, tracker.stall_last_total_bytes);
            tracker = out.tracker;
        }
    }

    /// A stalled event fires only on the active-to-stalled edge, and every
    /// resumed event follows a stalled one.
    #[test]
    fn test_stall_edges_are_one_time(polls in proptest::collection::vec(any_poll(), 1..60)) {
        let config = StallConfig::default();
        let mut tracker = StallTracker::default();
        let mut at = t0();
        let mut stall_open = false;

        for (gap, active, confidence, total) in polls {
            at += Duration::seconds(gap);
            let out = transition(&tracker, &Observation { active, confidence, total_bytes: total, at }, &config);
            for event in &out.events {
                match event {
                    StallEvent::Stalled { stall_seconds, .. } => {
                        prop_assert!(tracker.stall_state != StallState::Stalled);
                        prop_assert!(*stall_seconds >= config.stall_threshold_secs);
                        stall_open = true;
                    }
                    StallEvent::Resumed { .. } => {
                        prop_assert!(stall_open);
                        prop_assert_eq!(tracker.stall_state, StallState::Stalled);
                        stall_open = false;
                    }
                    StallEvent::Progress { .. } => {}
                }
            }
            tracker = out.tracker;
        }
    }

    /// Idle polls only change the state label.
    #[test]
    fn test_idle_keeps_byte_memory(polls in proptest::collection::vec(any_poll(), 1..60)) {
        let config = StallConfig::default();
        let mut tracker = StallTracker::default();
        let mut at = t0();

        for (gap, active, confidence, total) in polls {
            at += Duration::seconds(gap);
            let out = transition(&tracker, &Observation { active, confidence, total_bytes: total, at }, &config);
            if !active {
                prop_assert_eq!(out.tracker.stall_state, StallState::Idle);
                prop_assert_eq!(out.tracker.stall_last_total_bytes, tracker.stall_last_total_bytes);
                prop_assert!(out.events.is_empty());
            }
            tracker = out.tracker;
        }
    }

    /// The first trusted observation after a reset is a baseline, never a stall.
    #[test]
    fn test_first_observation_is_baseline(total in any::<u64>(), confidence in any_confidence()) {
        let out = transition(&StallTracker::default(), &Observation {
            active: true,
            confidence,
            total_bytes: Some(total),
            at: t0(),
        }, &StallConfig::default());
        prop_assert!(out.tracker.stall_state != StallState::Stalled);
        let stalled = out.events.iter().any(|e| matches!(e, StallEvent::Stalled { .. }));
        prop_assert!(!stalled, "first observation emitted a stalled event");
    }

    /// The listing parser never panics and never invents targets.
    #[test]
    fn test_listing_parser_total(text in "[ -~\n\t]{0,600}") {
        let targets = parse_target_listing(&text);
        let headers = text.lines().filter(|l| l.trim_start().starts_with("Target")).count();
        prop_assert!(targets.len() <= headers);
    }

    /// Generated listings round-trip ids, names and session addresses.
    #[test]
    fn test_listing_parser_recovers_fields(
        targets in proptest::collection::vec((1u32..500, "[a-z][a-z0-9-]{0,20}", proptest::collection::vec(any::<[u8; 4]>(), 0..4)), 0..6)
    ) {
        let mut text = String::new();
        for (id, name, ips) in &targets {
            text.push_str(&format!("Target {}: iqn.2024-01.local.netboot:{}\n", id, name));
            text.push_str("    System information:\n        Driver: iscsi\n");
            text.push_str("    I_T nexus information:\n");
            for (n, ip) in ips.iter().enumerate() {
                text.push_str(&format!("        I_T nexus: {}\n", n + 1));
                text.push_str("            Connection: 0\n");
                text.push_str(&format!("                IP Address: {}.{}.{}.{}\n", ip[0], ip[1], ip[2], ip[3]));
            }
            text.push_str("    LUN information:\n");
        }

        let parsed = parse_target_listing(&text);
        prop_assert_eq!(parsed.len(), targets.len());
        for (status, (id, name, ips)) in parsed.iter().zip(&targets) {
            prop_assert_eq!(status.target_id, *id);
            prop_assert_eq!(&status.target_name, &format!("iqn.2024-01.local.netboot:{}", name));
            prop_assert_eq!(status.session_count(), ips.len());
        }
    }

    /// The socket table parser never panics on arbitrary text.
    #[test]
    fn test_socket_parser_total(text in "[ -~\n\t]{0,600}") {
        let sockets = parse_socket_table(&text);
        prop_assert!(sockets.len() <= text.lines().count());
    }
}
