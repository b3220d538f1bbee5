//! A single-threaded I/O engine driven by a cooperative scheduler.
//!
//! Simio provides the primitives to build networked programs out of plain
//! futures that never run concurrently:
//!
//! - [`Environment`] schedules [events](Event) and [processes](Process) and
//!   waits for descriptors through a [backend](backend).
//! - [Sockets](socket) on the OS network or on a simulated
//!   [virtual network](backend::virtual_net).
//! - [`Packet`] framing, [`http`] with pipelining, [`websocket`] in both
//!   protocol versions and an [`rpc`] broker on top of packets.
//!
//! Everything that may fail later returns an [`Event`], and everything that
//! is wrong right away returns an [`Error`].

pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod logging;
pub mod packet;
pub mod rpc;
pub mod socket;
pub mod websocket;

pub use crate::core::{Environment, Event, Priority, Process};
pub use config::Config;
pub use error::Error;
pub use packet::{Packet, Utf8Packet};
pub use socket::{SharedSocket, Socket};
pub use websocket::{Message, WebSocket, WebSocketHixie};
