//! `minitcp`: a simplified, TCP-shaped reliable byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  client                                            server
//!  ┌──────────────────────┐                  ┌──────────────────────┐
//!  │ Sender ─ segments ───┼─────────────────▶│ Receiver + cache     │
//!  │ monitor_acks ◀─ ACKs ┼──────────────────┼─ (digest on FIN)     │
//!  └──────────┬───────────┘                  └──────────┬───────────┘
//!             │                                         │
//!  ┌──────────▼───────────┐                  ┌──────────▼───────────┐
//!  │ Connection::connect  │ ◀─ handshake ──▶ │ Connection::accept   │
//!  │  (state + timer)     │                  │  (state + timer)     │
//!  └──────────┬───────────┘                  └──────────┬───────────┘
//!  ┌──────────▼───────────┐                  ┌──────────▼───────────┐
//!  │ Socket               │ ◀── UDP (opt. ─▶ │ Socket               │
//!  └──────────────────────┘    simulator)    └──────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: 20-byte header, checksum, wire codec
//! - [`state`]: connection state machine
//! - [`socket`]: async UDP socket that speaks [`packet::Packet`]
//! - [`timer`]: bounded receive used for handshake retransmission
//! - [`connection`]: three-way handshake, both roles
//! - [`sender`]: segmentation, paced send, ACK monitor, retransmission
//! - [`cache`]: out-of-order segment store
//! - [`receiver`]: in-order reassembly and MD5 digest
//! - [`client`]: client role entrypoint
//! - [`server`]: server role entrypoint and accept loop
//! - [`simulator`]: lossy, delaying UDP relay

pub mod cache;
pub mod client;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;
