//! Retransmission timer.
//!
//! This is a blocking-wait-with-timeout primitive, not a background timer
//! task: [`RetransmitTimer::wait`] receives at most one datagram before a
//! deadline, and the caller decides what to resend when it reports
//! [`Wait::Expired`].  The handshake drivers in [`crate::connection`] use it to
//! retransmit their last control packet.
//!
//! The timeout is fixed for the lifetime of the timer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::packet::{Packet, PacketError};
use crate::socket::{Socket, SocketError};

/// Outcome of one bounded wait.
#[derive(Debug)]
pub enum Wait {
    /// A datagram arrived in time.  Its checksum has not been checked.
    Received(Packet, SocketAddr),
    /// Something arrived in time but was too short to be a packet.
    Malformed(PacketError),
    /// Nothing usable arrived before the deadline.
    Expired,
}

/// Bounded receive with a fixed timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitTimer {
    timeout: Duration,
}

impl RetransmitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for one datagram for at most the configured timeout.
    ///
    /// When `from` is set, datagrams from any other address are skipped
    /// without extending the deadline.  Only I/O failures are errors.
    pub async fn wait(&self, socket: &Socket, from: Option<SocketAddr>) -> Result<Wait, SocketError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match timeout_at(deadline, socket.recv_from()).await {
                Err(_elapsed) => return Ok(Wait::Expired),
                Ok(Ok((pkt, addr))) => {
                    if from.is_some_and(|peer| peer != addr) {
                        log::debug!("ignoring datagram from stranger {addr}");
                        continue;
                    }
                    return Ok(Wait::Received(pkt, addr));
                }
                Ok(Err(SocketError::Packet(e))) => return Ok(Wait::Malformed(e)),
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}
