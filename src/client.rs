//! Client side of the echo protocol.
//!
//! Both clients perform a single exchange: connect, send one line, read one
//! line back, close. The connection is opened before any input is read, so
//! an unreachable server is reported even when there is nothing to send.

use crate::protocol::{self, DELIMITER};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Failure of one client exchange.
#[derive(Debug)]
pub enum ClientError {
    /// Resolution or connection failed.
    Connect(io::Error),
    /// Input ended before a line could be read.
    NoInput,
    /// Reading the input failed.
    Input(io::Error),
    Send(io::Error),
    Receive(io::Error),
}

impl ClientError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::Connect(_) | ClientError::Input(_) => 1,
            ClientError::NoInput => 2,
            ClientError::Send(_) => 3,
            ClientError::Receive(_) => 4,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect error: {}", e),
            ClientError::NoInput => write!(f, "no input"),
            ClientError::Input(e) => write!(f, "input error: {}", e),
            ClientError::Send(e) => write!(f, "write error: {}", e),
            ClientError::Receive(e) => write!(f, "read error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(e)
            | ClientError::Input(e)
            | ClientError::Send(e)
            | ClientError::Receive(e) => Some(e),
            ClientError::NoInput => None,
        }
    }
}

/// Terminate `line` with exactly one delimiter.
pub fn frame_request(line: &str) -> String {
    let mut request = line.to_string();
    if !request.ends_with('\n') {
        request.push('\n');
    }
    request
}

/// Decode a raw reply line, dropping its line ending.
pub fn decode_reply(raw: &[u8]) -> String {
    String::from_utf8_lossy(protocol::trim_line_ending(raw)).into_owned()
}

/// Connect to `host:port`, trying every resolved address in turn.
pub fn connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let stream = TcpStream::connect((host, port)).map_err(ClientError::Connect)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Blocking exchange over `stream`. Returns the reply without its line ending.
pub fn exchange<S: io::Read + Write>(stream: S, line: &str) -> Result<String, ClientError> {
    let mut reader = BufReader::new(stream);

    reader
        .get_mut()
        .write_all(frame_request(line).as_bytes())
        .and_then(|()| reader.get_mut().flush())
        .map_err(ClientError::Send)?;

    let mut reply = Vec::new();
    reader
        .read_until(DELIMITER, &mut reply)
        .map_err(ClientError::Receive)?;
    if reply.last() != Some(&DELIMITER) {
        return Err(ClientError::Receive(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a full reply",
        )));
    }

    Ok(decode_reply(&reply))
}

/// Connect, exchange one line and close.
pub fn request(host: &str, port: u16, line: &str) -> Result<String, ClientError> {
    let stream = connect(host, port)?;
    let reply = exchange(&stream, line)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(reply)
}

/// Connect, then read one line from `input` and exchange it.
pub fn request_from<R: BufRead>(host: &str, port: u16, mut input: R) -> Result<String, ClientError> {
    let stream = connect(host, port)?;

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => return Err(ClientError::NoInput),
        Ok(_) => {}
        Err(e) => return Err(ClientError::Input(e)),
    }

    let reply = exchange(&stream, &line)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(reply)
}

/// Connect with tokio, trying every resolved address in turn.
pub async fn connect_async(host: &str, port: u16) -> io::Result<tokio::net::TcpStream> {
    let stream = tokio::net::TcpStream::connect((host, port)).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Async exchange over `stream`. Returns the reply without its line ending.
pub async fn exchange_async<S>(stream: &mut S, line: &str) -> Result<String, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(frame_request(line).as_bytes())
        .await
        .map_err(ClientError::Send)?;
    stream.flush().await.map_err(ClientError::Send)?;

    let mut reader = tokio::io::BufReader::new(stream);
    let mut reply = Vec::new();
    reader
        .read_until(DELIMITER, &mut reply)
        .await
        .map_err(ClientError::Receive)?;
    if reply.last() != Some(&DELIMITER) {
        return Err(ClientError::Receive(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a full reply",
        )));
    }

    Ok(decode_reply(&reply))
}

/// Connect, exchange one line and close, on the tokio runtime.
pub async fn request_async(host: &str, port: u16, line: &str) -> Result<String, ClientError> {
    let mut stream = connect_async(host, port)
        .await
        .map_err(ClientError::Connect)?;
    let reply = exchange_async(&mut stream, line).await?;
    let _ = stream.shutdown().await;
    Ok(reply)
}

/// Async counterpart of `request_from`.
pub async fn request_from_async<R>(host: &str, port: u16, mut input: R) -> Result<String, ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stream = connect_async(host, port)
        .await
        .map_err(ClientError::Connect)?;

    let mut line = String::new();
    match input.read_line(&mut line).await {
        Ok(0) => return Err(ClientError::NoInput),
        Ok(_) => {}
        Err(e) => return Err(ClientError::Input(e)),
    }

    let reply = exchange_async(&mut stream, &line).await?;
    let _ = stream.shutdown().await;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    /// In-memory duplex: reads from `input`, records writes.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl io::Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_request() {
        assert_eq!(frame_request("hello"), "hello\n");
        assert_eq!(frame_request("hello\n"), "hello\n");
    }

    #[test]
    fn test_blocking_exchange() {
        let mut stream = Scripted {
            input: Cursor::new(b"# echo> hello\r\n".to_vec()),
            written: Vec::new(),
        };
        let reply = exchange(&mut stream, "hello").unwrap();
        assert_eq!(reply, "# echo> hello");
        assert_eq!(stream.written, b"hello\n");
    }

    #[test]
    fn test_blocking_exchange_truncated_reply() {
        let stream = Scripted {
            input: Cursor::new(b"# echo> hel".to_vec()),
            written: Vec::new(),
        };
        let err = exchange(stream, "hello").unwrap_err();
        assert!(matches!(err, ClientError::Receive(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_connect_refused_exit_code() {
        let err = request("127.0.0.1", unused_port(), "hello").unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(err.exit_code(), 1);
    }

    fn unused_port() -> u16 {
        // Bind then drop to find a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_connect_failure_reported_before_input() {
        let err = request_from("127.0.0.1", unused_port(), io::empty()).unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_no_input_after_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = request_from("127.0.0.1", port, io::empty()).unwrap_err();
        assert!(matches!(err, ClientError::NoInput));
        assert_eq!(err.exit_code(), 2);

        // The connection was made before input ran out.
        listener.set_nonblocking(true).unwrap();
        assert!(listener.accept().is_ok());
    }

    #[tokio::test]
    async fn test_async_connect_failure_reported_before_input() {
        let err = request_from_async("127.0.0.1", unused_port(), tokio::io::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_async_no_input_after_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = request_from_async("127.0.0.1", port, tokio::io::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoInput));
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_async_exchange() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"hello\n")
            .read(b"# echo> hello\n")
            .build();
        let reply = exchange_async(&mut mock, "hello").await.unwrap();
        assert_eq!(reply, "# echo> hello");
    }

    #[tokio::test]
    async fn test_async_exchange_eof() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"hello\n")
            .read(b"# echo")
            .build();
        let err = exchange_async(&mut mock, "hello").await.unwrap_err();
        assert!(
            matches!(err, ClientError::Receive(ref e) if e.kind() == io::ErrorKind::UnexpectedEof)
        );
        assert_eq!(err.exit_code(), 4);
    }
}
