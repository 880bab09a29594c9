//! Event-loop runtime for the echo server.
//!
//! - `Listener`: owns the listening socket and drains the accept backlog
//! - `Session`: per-connection read/write/timeout state machine
//! - `TimerQueue`: cancellable inactivity deadlines
//! - `Worker`: mio poll loop dispatching readiness and timer expiry
//!
//! With several workers, each binds its own listener to the same address with
//! `SO_REUSEPORT` and runs an independent loop on its own thread. Workers
//! share nothing but the atomic [`Stats`].

mod event_loop;
mod listener;
mod session;
mod stats;
mod timer;

pub use event_loop::Worker;
pub use listener::{bind_listener, Accept, Listener, ACCEPT_BACKOFF, LISTENER_TOKEN};
pub use session::{CloseReason, Session, SessionCtx, SessionLimits, SessionState};
pub use stats::{Stats, StatsSnapshot};
pub use timer::{Expired, TimerHandle, TimerQueue};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Bound but not yet running server.
pub struct Server {
    config: Config,
    listeners: Vec<std::net::TcpListener>,
    local_addr: SocketAddr,
    stats: Arc<Stats>,
}

impl Server {
    /// Bind one listener per worker.
    ///
    /// Binding happens here so that startup failures (address in use,
    /// unresolvable host) surface before any worker starts.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let reuse_port = config.workers > 1;

        let first = bind_listener(addr, config.backlog, reuse_port)?;
        // Port 0 resolves to a concrete port that the other workers must share.
        let local_addr = first.local_addr()?;

        let mut listeners = Vec::with_capacity(config.workers);
        listeners.push(first);
        for _ in 1..config.workers {
            listeners.push(bind_listener(local_addr, config.backlog, reuse_port)?);
        }

        Ok(Self {
            config: config.clone(),
            listeners,
            local_addr,
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run all workers until they fail. Never returns under normal operation.
    pub fn run(self) -> io::Result<()> {
        info!(
            workers = self.listeners.len(),
            addr = %self.local_addr,
            "Starting event loop runtime"
        );

        let mut handles = Vec::with_capacity(self.listeners.len());

        for (worker_id, listener) in self.listeners.into_iter().enumerate() {
            listener.set_nonblocking(true)?;
            let config = self.config.clone();
            let stats = Arc::clone(&self.stats);

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    let listener = mio::net::TcpListener::from_std(listener);
                    let result = Worker::new(worker_id, listener, &config, stats)
                        .and_then(|mut worker| worker.run());
                    if let Err(e) = result {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;

            handles.push(handle);
        }

        // Wait for all workers
        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

/// Bind and serve with the event-loop runtime.
pub fn run(config: &Config) -> io::Result<()> {
    Server::bind(config)?.run()
}
