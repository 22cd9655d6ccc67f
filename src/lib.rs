//! Line-oriented TCP chat relay.
//!
//! Clients connect over TCP, are known by a display name (initially their
//! socket address), and exchange public broadcasts or private messages
//! through a central hub. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`hub`] tracks the online participants and fans broadcasts out to
//!   per-participant mailboxes through a single dispatcher task.
//! - [`server`] accepts connections and runs one session per participant: a
//!   read loop, a mailbox delivery task, and an idle watchdog that evicts
//!   silent connections.
//! - [`client`] connects to a relay and drives the interactive numeric menu.
//! - [`protocol`] provides the plain-text line protocol: framing, inbound
//!   command parsing, and the exact reply strings clients expect.
//!
//! Integration tests use this crate directly to exercise the hub and the
//! session lifecycle over real sockets.

pub mod cli;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod server;
