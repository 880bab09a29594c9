//! line-echo: a line-oriented TCP echo service
//!
//! Clients send newline-terminated lines; the server answers each one with
//! `# echo> <line>\n` on the same connection until the client disconnects or
//! stays idle past the configured timeout.
//!
//! - [`runtime`]: non-blocking mio event loop with one state machine per session
//! - [`blocking`]: one-client-at-a-time server, one exchange per connection
//! - [`client`]: single-exchange blocking and tokio clients
//! - [`protocol`]: line framing and reply encoding
//! - [`config`]: CLI and TOML configuration

pub mod blocking;
pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
