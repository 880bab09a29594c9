//! Inactivity timers for sessions.
//!
//! Each armed timer gets a unique generation number. The owning session keeps
//! the `TimerHandle` of its armed timer and hands it back to `cancel` when
//! the timer is no longer wanted, which removes the entry from the queue.
//! An expiry that was already collected before the session cancelled it is
//! still told apart by generation: the session ignores any handle other than
//! the one it holds.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Identifies one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    deadline: Instant,
    generation: u64,
}

/// An expired timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Session the timer was armed for.
    pub session_id: usize,
    /// Handle the timer was armed with.
    pub handle: TimerHandle,
}

/// Deadline queue shared by all sessions of one worker.
///
/// Keyed by `(deadline, generation)` so entries pop in deadline order and
/// a handle locates its entry directly.
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), usize>,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Arm a one-shot timer for `session_id` expiring at `deadline`.
    pub fn arm(&mut self, session_id: usize, deadline: Instant) -> TimerHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert((deadline, generation), session_id);
        TimerHandle {
            deadline,
            generation,
        }
    }

    /// Remove an armed timer. Returns false if it already expired or was
    /// cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.entries
            .remove(&(handle.deadline, handle.generation))
            .is_some()
    }

    /// Time until the earliest entry expires, zero if one already has.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, generation) = *entry.key();
            if deadline > now {
                break;
            }
            let session_id = entry.remove();
            fired.push(Expired {
                session_id,
                handle: TimerHandle {
                    deadline,
                    generation,
                },
            });
        }
        fired
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
