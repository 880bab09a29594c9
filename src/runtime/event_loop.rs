//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then sessions perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker owns its poller, listener, session arena and timer queue.
//! Sessions live in a slab and are addressed by their slot index, which is
//! also their poll token. A readiness event or timer expiry for a slot that
//! has already been reaped is dropped, and a session that reaches `Closed`
//! is removed from the slab in the same turn, closing its socket.

use crate::config::Config;
use crate::runtime::listener::{Accept, Listener, LISTENER_TOKEN};
use crate::runtime::session::{Session, SessionCtx, SessionLimits, SessionState};
use crate::runtime::stats::Stats;
use crate::runtime::timer::TimerQueue;
use mio::net::TcpListener;
use mio::{Events, Poll, Token};
use slab::Slab;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One event loop thread.
pub struct Worker<L: Accept = TcpListener> {
    id: usize,
    poll: Poll,
    events: Events,
    listener: Listener<L>,
    sessions: Slab<Session>,
    timers: TimerQueue,
    limits: SessionLimits,
    stats: Arc<Stats>,
}

impl<L: Accept> Worker<L> {
    /// Create a worker and register its listener.
    pub fn new(id: usize, listener: L, config: &Config, stats: Arc<Stats>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::new(listener);
        listener.register(poll.registry())?;

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            sessions: Slab::new(),
            timers: TimerQueue::new(),
            limits: SessionLimits {
                max_line: config.max_line,
                idle_timeout: config.idle_timeout,
            },
            stats,
        })
    }

    /// Serve forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            worker = self.id,
            max_line = self.limits.max_line,
            idle_timeout_ms = self.limits.idle_timeout.as_millis() as u64,
            "Worker started"
        );
        loop {
            self.turn()?;
        }
    }

    /// Wait for readiness or the next timer deadline, then dispatch
    /// everything that is due.
    pub fn turn(&mut self) -> io::Result<()> {
        let before = Instant::now();
        let timeout = [
            self.timers.next_timeout(before),
            self.listener.resume_timeout(before),
        ]
        .into_iter()
        .flatten()
        .min();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let Self {
            id,
            poll,
            events,
            listener,
            sessions,
            timers,
            limits,
            stats,
        } = self;
        let worker_id = *id;
        let limits: &SessionLimits = limits;
        let stats: &Stats = stats;
        let registry = poll.registry();
        let now = Instant::now();

        for event in events.iter() {
            let mut ctx = SessionCtx {
                registry,
                timers: &mut *timers,
                limits,
                stats,
                now,
            };

            match event.token() {
                LISTENER_TOKEN => {
                    listener.accept_ready(stats, now, |stream, peer| {
                        let entry = sessions.vacant_entry();
                        let session_id = entry.key();
                        stats.session_opened();
                        debug!(worker = worker_id, session = session_id, peer = %peer, "Accepted connection");

                        let session = entry.insert(Session::new(session_id, stream, peer));
                        let state = session.start(&mut ctx);
                        reap(sessions, session_id, state);
                    });
                }
                Token(session_id) => {
                    if let Some(session) = sessions.get_mut(session_id) {
                        let state = session.on_ready(&mut ctx);
                        reap(sessions, session_id, state);
                    }
                }
            }
        }

        for expired in timers.expired(now) {
            let mut ctx = SessionCtx {
                registry,
                timers: &mut *timers,
                limits,
                stats,
                now,
            };
            if let Some(session) = sessions.get_mut(expired.session_id) {
                let state = session.on_timer(expired.handle, &mut ctx);
                reap(sessions, expired.session_id, state);
            }
        }

        listener.resume_if_due(registry, now)
    }

    /// Sessions currently in the arena.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Armed inactivity timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

/// Drop a closed session, releasing its socket and buffers.
fn reap(sessions: &mut Slab<Session>, session_id: usize, state: SessionState) {
    if matches!(state, SessionState::Closed(_)) {
        sessions.try_remove(session_id);
    }
}
