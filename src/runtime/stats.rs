//! Server-wide counters shared by all workers.

use crate::runtime::session::CloseReason;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Connection and session counters.
#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    active: AtomicUsize,
    replies: AtomicU64,
    closed_peer: AtomicU64,
    closed_error: AtomicU64,
    closed_oversized: AtomicU64,
    closed_idle: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub accept_errors: u64,
    pub active: usize,
    pub replies: u64,
    pub closed_peer: u64,
    pub closed_error: u64,
    pub closed_oversized: u64,
    pub closed_idle: u64,
}

impl StatsSnapshot {
    /// Sessions that have reached `Closed` for any reason.
    pub fn closed(&self) -> u64 {
        self.closed_peer + self.closed_error + self.closed_oversized + self.closed_idle
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self, reason: CloseReason) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let counter = match reason {
            CloseReason::PeerClosed => &self.closed_peer,
            CloseReason::ReadError | CloseReason::WriteError => &self.closed_error,
            CloseReason::Oversized => &self.closed_oversized,
            CloseReason::IdleTimeout => &self.closed_idle,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reply_sent(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn accept_failed(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            closed_peer: self.closed_peer.load(Ordering::Relaxed),
            closed_error: self.closed_error.load(Ordering::Relaxed),
            closed_oversized: self.closed_oversized.load(Ordering::Relaxed),
            closed_idle: self.closed_idle.load(Ordering::Relaxed),
        }
    }
}
