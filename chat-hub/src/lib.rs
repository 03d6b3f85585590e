//! A line-oriented chat hub with a live WebSocket feed for observers.
//!
//! Clients connect over TCP, send a nickname, and then exchange
//! newline-delimited text frames. Each module owns one concern:
//!
//! - [`registry`] tracks active sessions and their nicknames.
//! - [`rate_limit`] implements the per-session sliding window.
//! - [`router`] delivers public and private messages and removes sessions
//!   that cannot keep up.
//! - [`session`] drives one client connection from handshake to removal.
//! - [`hub`] accepts connections and coordinates shutdown.
//! - [`observer`] republishes hub events to WebSocket observers on a
//!   dedicated single-threaded runtime.
//! - [`pipe`] and [`relay`] implement the nickname-marking relay.
//! - [`protocol`] holds frame I/O and the text rendered to clients.
//!
//! The binary in `main.rs` wires these together behind [`cli`].

pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod observer;
pub mod pipe;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod state;
pub mod stats;
