use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::CentralHandle;
use crate::config::PeerSpec;
use crate::queue::TimedQueue;

/// Per-peer connectivity state. Encoded as `u8` on the wire; the numeric
/// values are part of the external contract and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Never connected since process start.
    Unavailable = 0,
    Connected = 1,
    Disconnected = 2,
    Reconnecting = 3,
}

impl PeerStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Mutable per-slot record: roster identity, connectivity state, live handle
/// (if connected), and the peer's notification queue.
///
/// The queue outlives any individual connection attempt: it is created once
/// at startup and persists across reconnects, so in-flight data from a brief
/// disconnect isn't lost if the next payload arrives before the horizon expires.
pub struct PeerSession {
    pub spec: PeerSpec,
    pub status: PeerStatus,
    pub handle: Option<CentralHandle>,
    /// Arc'd so the notification callback (running on a backend task, not the
    /// scheduler task) can enqueue payloads directly without touching any
    /// other session field.
    pub queue: Arc<TimedQueue>,
    /// Set by the backend's disconnect callback; cleared and acted on by the
    /// scheduler on its next tick. This is the "weak back reference" the
    /// notification thread holds into session state: a flag, not a lock.
    pub link_lost: Arc<AtomicBool>,
}

impl PeerSession {
    pub fn new(spec: PeerSpec, freshness_horizon: Duration) -> Self {
        Self {
            spec,
            status: PeerStatus::Unavailable,
            handle: None,
            queue: Arc::new(TimedQueue::new(freshness_horizon)),
            link_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn short_name(&self) -> String {
        self.spec.short_name()
    }

    /// Drain the `link_lost` flag set by the backend's disconnect callback,
    /// applying the transition on the scheduler task if it was set.
    pub fn poll_link_lost(&mut self) {
        if self.link_lost.swap(false, Ordering::SeqCst) {
            self.mark_disconnected();
        }
    }

    /// Idempotent: calling this on an already-disconnected session is a no-op.
    /// The source called the equivalent cleanup both from the backend's
    /// disconnect callback and from the foreground reconnect path, so this
    /// must tolerate being invoked twice for the same loss event.
    pub fn mark_disconnected(&mut self) {
        if self.status == PeerStatus::Connected || self.status == PeerStatus::Reconnecting {
            self.status = PeerStatus::Disconnected;
        }
        self.handle = None;
    }

    pub fn mark_reconnecting(&mut self) {
        if matches!(self.status, PeerStatus::Disconnected | PeerStatus::Unavailable) {
            self.status = PeerStatus::Reconnecting;
        }
    }

    pub fn mark_connected(&mut self, handle: CentralHandle) {
        self.status = PeerStatus::Connected;
        self.handle = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PeerSpec {
        PeerSpec {
            address: "AA:BB:CC:DD:EE:01".into(),
            display_name: "LEFT_ARM".into(),
            short_name: None,
        }
    }

    #[test]
    fn starts_unavailable() {
        let session = PeerSession::new(spec(), Duration::from_millis(300));
        assert_eq!(session.status, PeerStatus::Unavailable);
        assert!(session.handle.is_none());
    }

    #[test]
    fn mark_disconnected_is_idempotent() {
        let mut session = PeerSession::new(spec(), Duration::from_millis(300));
        session.status = PeerStatus::Connected;
        session.mark_disconnected();
        assert_eq!(session.status, PeerStatus::Disconnected);
        // second call, as if both the callback and the foreground path fired
        session.mark_disconnected();
        assert_eq!(session.status, PeerStatus::Disconnected);
    }

    #[test]
    fn reconnecting_only_applies_from_disconnected_or_unavailable() {
        let mut session = PeerSession::new(spec(), Duration::from_millis(300));
        session.mark_reconnecting();
        assert_eq!(session.status, PeerStatus::Reconnecting);

        session.status = PeerStatus::Connected;
        session.mark_reconnecting();
        assert_eq!(session.status, PeerStatus::Connected);
    }

    #[test]
    fn poll_link_lost_applies_disconnect_set_from_another_task() {
        let mut session = PeerSession::new(spec(), Duration::from_millis(300));
        session.status = PeerStatus::Connected;
        let flag = session.link_lost.clone();

        flag.store(true, Ordering::SeqCst);
        session.poll_link_lost();

        assert_eq!(session.status, PeerStatus::Disconnected);
        // the flag is consumed, not sticky
        assert!(!session.link_lost.load(Ordering::SeqCst));
    }
}
