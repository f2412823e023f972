use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::codec::{decode_payload, CombinedFrame, PeerEntry};
use crate::session::{PeerSession, PeerStatus};

/// Why a tick produced no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// At least one roster slot has no fresh payload.
    EmptyQueue,
    /// A peer's payload failed to decode; the whole frame is dropped.
    DecodeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Frame,
    Skipped(SkipReason),
    /// All sessions are connected but queues have been empty for
    /// `max_consecutive_fail` ticks straight: time for the supervisor to
    /// power-cycle the adapter. Carries the fail count that tripped it, for
    /// the recovery log line.
    AdapterRecoveryNeeded { consecutive_fails: u32 },
}

/// The time-alignment and dispatch engine. Holds no peer state itself
/// beyond the rolling empty-tick counter; sessions are owned by the scheduler
/// and passed in by reference each tick.
pub struct Aggregator {
    max_skew: Duration,
    max_consecutive_fail: u32,
    consecutive_empty_packet_count: u32,
}

impl Aggregator {
    pub fn new(max_skew: Duration, max_consecutive_fail: u32) -> Self {
        Self {
            max_skew,
            max_consecutive_fail,
            consecutive_empty_packet_count: 0,
        }
    }

    /// Run one tick. Entirely synchronous: must never suspend, since the
    /// scheduler relies on the tick completing within one scheduling slot.
    pub fn tick(&mut self, sessions: &[PeerSession]) -> (TickOutcome, Option<CombinedFrame>) {
        loop {
            let newest: Vec<Option<(Instant, Vec<u8>)>> = sessions
                .iter()
                .map(|s| s.queue.peek_newest().map(|e| (e.arrived_at, e.payload)))
                .collect();

            if newest.iter().any(Option::is_none) {
                self.consecutive_empty_packet_count += 1;
                debug!(
                    count = self.consecutive_empty_packet_count,
                    "skipping tick: at least one peer has no fresh payload"
                );

                if self.consecutive_empty_packet_count > self.max_consecutive_fail
                    && sessions.iter().all(|s| s.status == PeerStatus::Connected)
                {
                    let consecutive_fails = self.consecutive_empty_packet_count;
                    warn!(
                        consecutive_fails,
                        "all peers connected but queues starved; requesting adapter recovery"
                    );
                    self.consecutive_empty_packet_count = 0;
                    return (TickOutcome::AdapterRecoveryNeeded { consecutive_fails }, None);
                }

                return (TickOutcome::Skipped(SkipReason::EmptyQueue), None);
            }

            self.consecutive_empty_packet_count = 0;

            let times: Vec<Instant> = newest.iter().map(|n| n.as_ref().unwrap().0).collect();
            let newest_time = *times.iter().max().unwrap();
            let oldest_time = *times.iter().min().unwrap();
            let skew = newest_time.duration_since(oldest_time);

            if skew > self.max_skew {
                let straggler = times
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, t)| **t)
                    .map(|(i, _)| i)
                    .unwrap();
                debug!(
                    slot = straggler,
                    skew_ms = skew.as_millis(),
                    "skew exceeds bound, dropping straggler's oldest backlog entry"
                );
                sessions[straggler].queue.pop_oldest();
                continue;
            }

            let mut peers = std::collections::BTreeMap::new();
            for (session, entry) in sessions.iter().zip(newest.into_iter()) {
                let (_, payload) = entry.unwrap();
                match decode_payload(&session.short_name(), &payload) {
                    Ok(decoded) => {
                        peers.insert(
                            session.short_name(),
                            PeerEntry::new(decoded, session.status),
                        );
                    }
                    Err(e) => {
                        warn!(peer = %session.short_name(), error = %e, "dropping frame: decode failed");
                        return (TickOutcome::Skipped(SkipReason::DecodeError), None);
                    }
                }
            }

            let t = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();

            return (TickOutcome::Frame, Some(CombinedFrame { t, peers }));
        }
    }
}
