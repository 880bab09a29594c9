//! Listening socket and accept loop.
//!
//! The listener has exactly one outstanding accept at a time: when the poller
//! reports it readable, the worker drains the backlog here until the kernel
//! says `WouldBlock`. An accept error never ends accepting. It is logged and
//! counted, and the listener is paused for `ACCEPT_BACKOFF`. Once the pause
//! is over the worker refreshes the registration, so any connection still
//! queued is reported again. A persistent error such as `EMFILE` costs one
//! accept attempt per backoff period instead of a busy loop.

use crate::runtime::stats::Stats;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll token reserved for the listener.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// How long accepting pauses after an accept error.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Source of accepted connections.
pub trait Accept: Source {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Accept for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Owns the listening endpoint of one worker.
pub struct Listener<L: Accept = TcpListener> {
    inner: L,
    /// Set while paused after an accept error.
    resume_at: Option<Instant>,
}

impl<L: Accept> Listener<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            resume_at: None,
        }
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.inner, LISTENER_TOKEN, Interest::READABLE)
    }

    /// Accept every queued connection, handing each to `on_accept`.
    ///
    /// Does nothing while paused. The queued connections are picked up by
    /// `resume_if_due`.
    pub fn accept_ready(
        &mut self,
        stats: &Stats,
        now: Instant,
        mut on_accept: impl FnMut(TcpStream, SocketAddr),
    ) {
        if self.resume_at.is_some() {
            return;
        }

        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    stats.accept_failed();
                    warn!(error = %e, "Accept interrupted, retrying");
                }
                Err(e) => {
                    stats.accept_failed();
                    warn!(
                        error = %e,
                        backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                        "Accept error, pausing"
                    );
                    self.resume_at = Some(now + ACCEPT_BACKOFF);
                    return;
                }
            }
        }
    }

    /// Time left in the current pause, if paused.
    pub fn resume_timeout(&self, now: Instant) -> Option<Duration> {
        self.resume_at.map(|at| at.saturating_duration_since(now))
    }

    /// End an expired pause by refreshing the registration, which makes the
    /// poller report any connection still queued.
    pub fn resume_if_due(&mut self, registry: &Registry, now: Instant) -> io::Result<()> {
        match self.resume_at {
            Some(at) if at <= now => {
                self.resume_at = None;
                debug!("Resuming accept");
                registry.reregister(&mut self.inner, LISTENER_TOKEN, Interest::READABLE)
            }
            _ => Ok(()),
        }
    }
}

/// Create a listening socket with `SO_REUSEADDR`, plus `SO_REUSEPORT` when
/// several workers share the address.
pub fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
