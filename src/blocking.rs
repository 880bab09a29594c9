//! Blocking one-shot server.
//!
//! Serves one client at a time on the calling thread: accept, read a single
//! line, reply, close. No concurrency and no session reuse; a slow client
//! delays everyone behind it, bounded by the idle timeout applied as the
//! socket read timeout.

use crate::config::Config;
use crate::protocol::{self, DELIMITER};
use crate::runtime::bind_listener;
use bytes::BytesMut;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bind and serve forever.
pub fn run(config: &Config) -> io::Result<()> {
    let addr = config
        .socket_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let listener = bind_listener(addr, config.backlog, false)?;
    info!(addr = %listener.local_addr()?, "Starting blocking runtime");
    serve(listener, config.max_line, config.idle_timeout)
}

/// Accept loop. Accept errors are logged and never end the loop.
pub fn serve(listener: TcpListener, max_line: usize, read_timeout: Duration) -> io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_client(&stream, max_line, read_timeout) {
                    debug!(error = %e, "Client error");
                }
                let _ = stream.shutdown(Shutdown::Both);
                debug!("Connection closed");
            }
            Err(e) => warn!(error = %e, "Accept error"),
        }
    }
    Ok(())
}

/// One exchange: read a line, write its echo.
fn handle_client(stream: &TcpStream, max_line: usize, read_timeout: Duration) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_nodelay(true)?;
    debug!(peer = %peer, "Client connected");

    let mut line = Vec::new();
    // One byte past `max_line` for the delimiter.
    let limit = (max_line as u64).saturating_add(1);
    BufReader::new(stream.take(limit)).read_until(DELIMITER, &mut line)?;

    if line.last() != Some(&DELIMITER) {
        if line.len() > max_line {
            warn!(peer = %peer, max_line, "Line too long, closing");
        } else {
            debug!(peer = %peer, "Peer closed before sending a line");
        }
        return Ok(());
    }

    let mut reply = BytesMut::new();
    protocol::encode_reply(protocol::trim_line_ending(&line), &mut reply);
    let mut writer = stream;
    writer.write_all(&reply)?;
    debug!(peer = %peer, reply_len = reply.len(), "Replied");
    Ok(())
}
