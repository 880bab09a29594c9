//! Session state machine for one accepted connection.
//!
//! ```text
//!            line framed                 reply fully written
//! Reading ─────────────────▶ Writing ─────────────────────▶ Reading ...
//!    │                          │
//!    │ EOF / read error /       │ write error
//!    │ oversized / idle timer   │
//!    ▼                          ▼
//!  Closed ◀─────────────────────┘
//! ```
//!
//! A session never has more than one operation in flight: it reads only in
//! `Reading` and writes only in `Writing`. The inactivity timer is armed
//! exactly while in `Reading`.

use crate::protocol::{self, ParseResult};
use crate::runtime::stats::Stats;
use crate::runtime::timer::{TimerHandle, TimerQueue};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound on bytes pulled from the socket per read call.
const READ_CHUNK: usize = 16 * 1024;

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its write side.
    PeerClosed,
    ReadError,
    WriteError,
    /// More than `max_line` bytes buffered without a newline.
    Oversized,
    /// No line completed within the idle window.
    IdleTimeout,
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a complete line. Inactivity timer armed.
    Reading,
    /// Writing the reply for the last line.
    Writing {
        /// Bytes of the reply already written.
        written: usize,
    },
    /// Terminal.
    Closed(CloseReason),
}

/// Limits applied to every session of a worker.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_line: usize,
    pub idle_timeout: Duration,
}

/// Worker resources a session needs while handling an event.
pub struct SessionCtx<'a> {
    pub registry: &'a Registry,
    pub timers: &'a mut TimerQueue,
    pub limits: &'a SessionLimits,
    pub stats: &'a Stats,
    pub now: Instant,
}

/// What a session step wants next.
enum Step {
    /// State changed or data moved; run the state machine again.
    Continue,
    /// Park until the socket reports this readiness.
    Wait(Interest),
    Close(CloseReason),
}

/// A single client connection.
pub struct Session {
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    state: SessionState,
    /// Unconsumed input. Never holds more than `max_line + 1` bytes.
    read_buf: BytesMut,
    /// Reply being written.
    out_buf: BytesMut,
    /// Armed inactivity timer, if any.
    timer: Option<TimerHandle>,
    /// Readiness currently registered with the poller.
    interest: Interest,
}

impl Session {
    /// Wrap an accepted stream. `id` doubles as the poll token.
    pub fn new(id: usize, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            state: SessionState::Reading,
            read_buf: BytesMut::with_capacity(1024),
            out_buf: BytesMut::with_capacity(1024),
            timer: None,
            interest: Interest::READABLE,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed(_))
    }

    /// Handle of the armed inactivity timer.
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    /// Register with the poller, arm the inactivity timer and start reading.
    pub fn start(&mut self, ctx: &mut SessionCtx<'_>) -> SessionState {
        if let Err(e) = self.stream.set_nodelay(true) {
            trace!(session = self.id, error = %e, "Failed to disable Nagle");
        }

        if let Err(e) = ctx
            .registry
            .register(&mut self.stream, Token(self.id), Interest::READABLE)
        {
            debug!(session = self.id, error = %e, "Failed to register session");
            self.close(CloseReason::ReadError, ctx);
            return self.state;
        }

        self.interest = Interest::READABLE;
        self.arm_timer(ctx);
        self.drive(ctx)
    }

    /// Handle a readiness event for this session's socket.
    pub fn on_ready(&mut self, ctx: &mut SessionCtx<'_>) -> SessionState {
        self.drive(ctx)
    }

    /// Handle an expired inactivity timer.
    ///
    /// Only the timer the session currently holds can close it. Expiries of
    /// cancelled or replaced timers are ignored.
    pub fn on_timer(&mut self, handle: TimerHandle, ctx: &mut SessionCtx<'_>) -> SessionState {
        if self.state == SessionState::Reading && self.timer == Some(handle) {
            self.close(CloseReason::IdleTimeout, ctx);
        } else {
            trace!(session = self.id, "Ignoring stale timer");
        }
        self.state
    }

    /// Enter `Closed`. Safe to call any number of times.
    pub fn close(&mut self, reason: CloseReason, ctx: &mut SessionCtx<'_>) {
        if self.is_closed() {
            return;
        }

        self.cancel_timer(ctx);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = ctx.registry.deregister(&mut self.stream);
        self.read_buf = BytesMut::new();
        self.out_buf = BytesMut::new();
        self.state = SessionState::Closed(reason);
        ctx.stats.session_closed(reason);

        debug!(session = self.id, peer = %self.peer, reason = ?reason, "Session closed");
    }

    /// Run the state machine until it has to wait for the socket or closes.
    fn drive(&mut self, ctx: &mut SessionCtx<'_>) -> SessionState {
        loop {
            let step = match self.state {
                SessionState::Reading => self.step_read(ctx),
                SessionState::Writing { written } => self.step_write(written, ctx),
                SessionState::Closed(_) => return self.state,
            };

            match step {
                Step::Continue => {}
                Step::Wait(interest) => match self.want(interest, ctx.registry) {
                    Ok(()) => return self.state,
                    Err(e) => {
                        debug!(session = self.id, error = %e, "Failed to reregister session");
                        let reason = if interest == Interest::WRITABLE {
                            CloseReason::WriteError
                        } else {
                            CloseReason::ReadError
                        };
                        self.close(reason, ctx);
                    }
                },
                Step::Close(reason) => self.close(reason, ctx),
            }
        }
    }

    fn step_read(&mut self, ctx: &mut SessionCtx<'_>) -> Step {
        // Serve a buffered line before touching the socket.
        match protocol::parse(&self.read_buf, ctx.limits.max_line) {
            ParseResult::Complete(line) => {
                self.cancel_timer(ctx);
                self.out_buf.clear();
                protocol::encode_reply(&self.read_buf[..line.len], &mut self.out_buf);
                self.read_buf.advance(line.consumed);
                self.state = SessionState::Writing { written: 0 };
                return Step::Continue;
            }
            ParseResult::TooLong => return Step::Close(CloseReason::Oversized),
            ParseResult::Incomplete => {}
        }

        // Incomplete means at most `max_line` bytes are buffered, so there is
        // always room for at least one more byte.
        let filled = self.read_buf.len();
        let room = (ctx.limits.max_line.saturating_add(1) - filled).min(READ_CHUNK);
        self.read_buf.resize(filled + room, 0);

        let result = self.stream.read(&mut self.read_buf[filled..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.read_buf.truncate(filled + n);

        match result {
            Ok(0) => Step::Close(CloseReason::PeerClosed),
            Ok(_) => Step::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Step::Wait(Interest::READABLE),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(e) => {
                debug!(session = self.id, error = %e, "Read failed");
                Step::Close(CloseReason::ReadError)
            }
        }
    }

    fn step_write(&mut self, written: usize, ctx: &mut SessionCtx<'_>) -> Step {
        let total = self.out_buf.len();
        match self.stream.write(&self.out_buf[written..total]) {
            Ok(0) => {
                debug!(session = self.id, "Write returned 0");
                Step::Close(CloseReason::WriteError)
            }
            Ok(n) if written + n < total => {
                self.state = SessionState::Writing {
                    written: written + n,
                };
                Step::Continue
            }
            Ok(_) => {
                self.state = SessionState::Reading;
                self.arm_timer(ctx);
                ctx.stats.reply_sent();
                debug!(session = self.id, reply_len = total, "Echoed line");
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Step::Wait(Interest::WRITABLE),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(e) => {
                debug!(session = self.id, error = %e, "Write failed");
                Step::Close(CloseReason::WriteError)
            }
        }
    }

    fn arm_timer(&mut self, ctx: &mut SessionCtx<'_>) {
        self.cancel_timer(ctx);
        let deadline = ctx.now + ctx.limits.idle_timeout;
        self.timer = Some(ctx.timers.arm(self.id, deadline));
    }

    fn cancel_timer(&mut self, ctx: &mut SessionCtx<'_>) {
        if let Some(handle) = self.timer.take() {
            ctx.timers.cancel(handle);
        }
    }

    fn want(&mut self, interest: Interest, registry: &Registry) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.stream, Token(self.id), interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use socket2::SockRef;
    use std::io::{BufRead, BufReader};
    use std::thread;

    struct Harness {
        poll: Poll,
        events: Events,
        timers: TimerQueue,
        limits: SessionLimits,
        stats: Stats,
        session: Session,
        client: Option<std::net::TcpStream>,
    }

    impl Harness {
        fn new(max_line: usize) -> Self {
            Self::build(max_line, None)
        }

        /// Shrink the server's send buffer and the client's receive buffer
        /// so a large reply cannot be written in one call.
        fn with_small_buffers(max_line: usize) -> Self {
            Self::build(max_line, Some(4096))
        }

        fn build(max_line: usize, buffer_size: Option<usize>) -> Self {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let (server, peer) = listener.accept().unwrap();
            server.set_nonblocking(true).unwrap();

            if let Some(size) = buffer_size {
                SockRef::from(&server).set_send_buffer_size(size).unwrap();
                SockRef::from(&client).set_recv_buffer_size(size).unwrap();
            }

            let stats = Stats::new();
            stats.session_opened();

            let mut harness = Self {
                poll: Poll::new().unwrap(),
                events: Events::with_capacity(16),
                timers: TimerQueue::new(),
                limits: SessionLimits {
                    max_line,
                    idle_timeout: Duration::from_secs(60),
                },
                stats,
                session: Session::new(0, TcpStream::from_std(server), peer),
                client: Some(client),
            };

            let mut ctx = SessionCtx {
                registry: harness.poll.registry(),
                timers: &mut harness.timers,
                limits: &harness.limits,
                stats: &harness.stats,
                now: Instant::now(),
            };
            harness.session.start(&mut ctx);
            harness
        }

        fn client(&self) -> &std::net::TcpStream {
            self.client.as_ref().unwrap()
        }

        /// Write `data` from a background thread so the session can be
        /// driven while the client blocks.
        fn send_in_background(&self, data: Vec<u8>) -> thread::JoinHandle<()> {
            let mut writer = self.client().try_clone().unwrap();
            thread::spawn(move || writer.write_all(&data).unwrap())
        }

        /// Poll and drive the session until `done` holds or time runs out.
        fn pump_until(&mut self, done: impl Fn(&Session, &Stats) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(&self.session, &self.stats) && Instant::now() < deadline {
                self.poll
                    .poll(&mut self.events, Some(Duration::from_millis(10)))
                    .unwrap();
                let mut ctx = SessionCtx {
                    registry: self.poll.registry(),
                    timers: &mut self.timers,
                    limits: &self.limits,
                    stats: &self.stats,
                    now: Instant::now(),
                };
                self.session.on_ready(&mut ctx);
            }
        }

        fn with_ctx<R>(&mut self, f: impl FnOnce(&mut Session, &mut SessionCtx<'_>) -> R) -> R {
            let mut ctx = SessionCtx {
                registry: self.poll.registry(),
                timers: &mut self.timers,
                limits: &self.limits,
                stats: &self.stats,
                now: Instant::now(),
            };
            f(&mut self.session, &mut ctx)
        }
    }

    fn is_writing_partially(session: &Session) -> bool {
        matches!(session.state(), SessionState::Writing { written } if written > 0)
    }

    fn large_line(len: usize) -> Vec<u8> {
        let mut line: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
        line.push(b'\n');
        line
    }

    #[test]
    fn test_start_arms_timer() {
        let h = Harness::new(64);
        assert_eq!(h.session.state(), SessionState::Reading);
        assert!(h.session.timer().is_some());
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn test_echo_cycle() {
        let mut h = Harness::new(64);
        let first_timer = h.session.timer();

        h.client().write_all(b"hello\r\n").unwrap();
        h.pump_until(|_, stats| stats.snapshot().replies == 1);

        assert_eq!(h.session.state(), SessionState::Reading);
        assert_eq!(h.stats.snapshot().replies, 1);
        assert!(h.session.timer().is_some());
        assert_ne!(h.session.timer(), first_timer);
        // The first timer was removed, not left behind.
        assert_eq!(h.timers.len(), 1);

        let mut reader = BufReader::new(h.client().try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply, "# echo> hello\n");
    }

    #[test]
    fn test_pipelined_lines_answered_in_order() {
        let mut h = Harness::new(64);
        h.client().write_all(b"one\ntwo\r\nthree\n").unwrap();
        h.pump_until(|_, stats| stats.snapshot().replies == 3);
        assert_eq!(h.timers.len(), 1);

        let mut reader = BufReader::new(h.client().try_clone().unwrap());
        for expected in ["# echo> one\n", "# echo> two\n", "# echo> three\n"] {
            let mut reply = String::new();
            reader.read_line(&mut reply).unwrap();
            assert_eq!(reply, expected);
        }
    }

    #[test]
    fn test_unbounded_max_line() {
        let mut h = Harness::new(usize::MAX);
        h.client().write_all(b"hi\n").unwrap();
        h.pump_until(|_, stats| stats.snapshot().replies == 1);

        let mut reader = BufReader::new(h.client().try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply, "# echo> hi\n");
    }

    #[test]
    fn test_peer_close() {
        let mut h = Harness::new(64);
        h.client().shutdown(Shutdown::Write).unwrap();
        h.pump_until(|s, _| s.is_closed());

        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::PeerClosed));
        assert!(h.session.timer().is_none());
        assert!(h.timers.is_empty());
        assert_eq!(h.stats.snapshot().active, 0);
    }

    #[test]
    fn test_oversized_input_closes_without_reply() {
        let mut h = Harness::new(8);
        h.client().write_all(b"0123456789abcdef").unwrap();
        h.pump_until(|s, _| s.is_closed());

        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::Oversized));
        assert_eq!(h.stats.snapshot().replies, 0);
        assert!(h.timers.is_empty());

        let mut buf = [0u8; 16];
        match h.client().read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
        }
    }

    #[test]
    fn test_large_reply_resumes_after_would_block() {
        let line = large_line(512 * 1024);
        let mut h = Harness::with_small_buffers(1024 * 1024);

        let writer = h.send_in_background(line.clone());
        h.pump_until(|s, _| is_writing_partially(s));
        writer.join().unwrap();

        // Parked on writability with no timer running.
        assert!(is_writing_partially(&h.session));
        assert!(h.session.timer().is_none());
        assert!(h.timers.is_empty());

        let mut reader = BufReader::new(h.client().try_clone().unwrap());
        let reader = thread::spawn(move || {
            let mut reply = Vec::new();
            reader.read_until(b'\n', &mut reply).unwrap();
            reply
        });
        h.pump_until(|_, stats| stats.snapshot().replies == 1);

        assert_eq!(h.session.state(), SessionState::Reading);
        assert_eq!(h.timers.len(), 1);

        let mut expected = b"# echo> ".to_vec();
        expected.extend_from_slice(&line);
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_write_error_closes_session() {
        let line = large_line(512 * 1024);
        let mut h = Harness::with_small_buffers(1024 * 1024);

        let writer = h.send_in_background(line);
        h.pump_until(|s, _| is_writing_partially(s));
        writer.join().unwrap();
        assert!(is_writing_partially(&h.session));

        // Abort the client so the pending reply hits a reset connection.
        let client = h.client.take().unwrap();
        SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        h.pump_until(|s, _| s.is_closed());
        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::WriteError));
        assert!(h.timers.is_empty());

        let snap = h.stats.snapshot();
        assert_eq!(snap.closed_error, 1);
        assert_eq!(snap.replies, 0);
        assert_eq!(snap.active, 0);
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut h = Harness::new(64);
        let stale = h.session.timer().unwrap();

        h.client().write_all(b"ping\n").unwrap();
        h.pump_until(|_, stats| stats.snapshot().replies == 1);
        let live = h.session.timer().unwrap();

        let state = h.with_ctx(|s, ctx| s.on_timer(stale, ctx));
        assert_eq!(state, SessionState::Reading);

        let state = h.with_ctx(|s, ctx| s.on_timer(live, ctx));
        assert_eq!(state, SessionState::Closed(CloseReason::IdleTimeout));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut h = Harness::new(64);
        h.with_ctx(|s, ctx| {
            s.close(CloseReason::ReadError, ctx);
            s.close(CloseReason::IdleTimeout, ctx);
        });

        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::ReadError));
        assert!(h.timers.is_empty());
        let snap = h.stats.snapshot();
        assert_eq!(snap.closed(), 1);
        assert_eq!(snap.active, 0);

        // A timer firing after close has no effect.
        let state = h.with_ctx(|s, ctx| {
            let handle = ctx.timers.arm(s.id(), ctx.now);
            s.on_timer(handle, ctx)
        });
        assert_eq!(state, SessionState::Closed(CloseReason::ReadError));
    }
}
