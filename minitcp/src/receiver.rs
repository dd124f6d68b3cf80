//! Inbound half of the reliable transfer engine.
//!
//! [`Receiver`] is a pure state value: it takes one decoded segment at a time
//! and reports what the caller should send back.  It tracks
//!
//! - the cumulative frontier (next in-order sequence number, `RCV.NXT`),
//! - an [`OutOfOrderCache`] of segments that arrived ahead of the frontier,
//! - a running MD5 over every byte delivered in order.
//!
//! Bytes reach the digest strictly in sequence order with no gaps and no
//! repeats.  A segment at the frontier is absorbed and then the cache is
//! drained for as long as it continues the stream.  Segments ahead of the
//! frontier are cached without an ACK; segments behind it are dropped and
//! the frontier is re-acknowledged.
//!
//! The stream ends when a FIN-bearing segment is absorbed at the frontier
//! (directly or from the cache), so no gap can precede it.
//!
//! [`receive_stream`] drives a [`Receiver`] over an established
//! [`Connection`].

use std::net::SocketAddr;

use md5::{Digest, Md5};

use crate::cache::OutOfOrderCache;
use crate::connection::{ConnError, Connection};
use crate::packet::{flags, seq_lt, Packet};
use crate::socket::{Socket, SocketError};
use crate::state::ConnectionState;

/// Window value placed in every ACK.  Advisory only; nothing throttles on it.
pub const ADVERTISED_WINDOW: u16 = 8192;

/// Lowercase hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// What the caller should do after [`Receiver::on_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Checksum failed.  Send a duplicate ACK for `ack`.
    Corrupt { ack: u32 },
    /// In-order data was delivered.  Send one ACK per entry, in order.
    Delivered { acks: Vec<u32>, finished: bool },
    /// Ahead of the frontier; cached, nothing to send.
    Buffered { seq: u32 },
    /// Already delivered.  Re-acknowledge `ack`.
    Stale { ack: u32 },
    /// The peer aborted the connection.
    Reset,
    /// Control traffic with no bearing on the stream.
    Ignored,
}

/// Delivered-stream progress, kept apart from the cache so a drain can
/// mutate both at once.
#[derive(Debug)]
struct Stream {
    frontier: u32,
    hasher: Md5,
    delivered: usize,
    finished: bool,
}

impl Stream {
    /// Append `pkt` to the stream.  Returns the new frontier.
    fn absorb(&mut self, pkt: &Packet) -> u32 {
        self.hasher.update(&pkt.payload);
        self.delivered += pkt.payload.len();
        self.frontier = pkt.seq_end();
        if pkt.header.has(flags::FIN) {
            self.finished = true;
        }
        self.frontier
    }
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    stream: Stream,
    cache: OutOfOrderCache,
}

impl Receiver {
    /// `rcv_nxt` is the first sequence number expected from the peer.  After
    /// the handshake this is the peer's ISN + 1.
    pub fn new(rcv_nxt: u32) -> Self {
        Self {
            stream: Stream {
                frontier: rcv_nxt,
                hasher: Md5::new(),
                delivered: 0,
                finished: false,
            },
            cache: OutOfOrderCache::new(),
        }
    }

    /// Cumulative ACK for the next outbound packet.
    pub fn ack_number(&self) -> u32 {
        self.stream.frontier
    }

    /// Window advertised on every ACK.
    pub fn window_size(&self) -> u16 {
        ADVERTISED_WINDOW
    }

    /// Payload bytes delivered in order so far.
    pub fn bytes_delivered(&self) -> usize {
        self.stream.delivered
    }

    pub fn is_finished(&self) -> bool {
        self.stream.finished
    }

    /// Segments waiting in the out-of-order cache.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Process one inbound segment.
    pub fn on_segment(&mut self, pkt: Packet) -> Outcome {
        let frontier = self.stream.frontier;
        if !pkt.validate_checksum() {
            return Outcome::Corrupt { ack: frontier };
        }

        let h = pkt.header;
        if h.has(flags::RST) {
            return Outcome::Reset;
        }
        if h.has(flags::SYN) || (pkt.payload.is_empty() && !h.has(flags::FIN)) {
            return Outcome::Ignored;
        }
        if self.stream.finished || seq_lt(h.seq, frontier) {
            return Outcome::Stale { ack: frontier };
        }
        if h.seq != frontier {
            if self.cache.insert(pkt).is_some() {
                log::debug!("[receiver] replaced cached segment seq={}", h.seq);
            }
            return Outcome::Buffered { seq: h.seq };
        }

        let mut acks = vec![self.stream.absorb(&pkt)];
        if !self.stream.finished {
            for next in self.cache.drain_from(self.stream.frontier) {
                acks.push(self.stream.absorb(&next));
                if self.stream.finished {
                    break;
                }
            }
        }
        if self.stream.finished {
            let leftover = self.cache.clear();
            if leftover > 0 {
                log::warn!("[receiver] discarded {leftover} cached segment(s) past FIN");
            }
        }

        Outcome::Delivered {
            acks,
            finished: self.stream.finished,
        }
    }

    /// Finish the digest.  Lowercase hex.
    pub fn into_digest(self) -> String {
        hex::encode(self.stream.hasher.finalize())
    }
}

/// Result of a completed inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub peer: SocketAddr,
    pub bytes: usize,
    pub digest: String,
}

/// Receive one whole stream on an established connection.
///
/// Blocks until the FIN-bearing segment is delivered in order, then closes
/// the connection and returns the digest.  Datagrams from other addresses
/// and runt datagrams are skipped.  An RST closes the connection with
/// [`ConnError::Reset`].
pub async fn receive_stream(conn: &mut Connection) -> Result<Delivery, ConnError> {
    conn.require(ConnectionState::Established)?;
    let peer = conn.peer();
    let mut receiver = Receiver::new(conn.rcv_nxt());
    let mut early = conn.take_early_segment();
    log::debug!("[receiver] expecting data from {peer} at seq={}", receiver.ack_number());

    loop {
        let pkt = match early.take() {
            Some(pkt) => pkt,
            None => next_from(conn.socket(), peer).await?,
        };

        let seq = pkt.header.seq;
        match receiver.on_segment(pkt) {
            Outcome::Corrupt { ack } => {
                log::debug!("[receiver] corrupt segment; duplicate ACK {ack}");
                send_ack(conn, ack, receiver.window_size()).await?;
            }
            Outcome::Stale { ack } => {
                log::debug!("[receiver] stale segment seq={seq}; re-ACK {ack}");
                send_ack(conn, ack, receiver.window_size()).await?;
            }
            Outcome::Buffered { seq } => {
                log::debug!(
                    "[receiver] cached out-of-order seq={seq} (frontier {}, {} cached)",
                    receiver.ack_number(),
                    receiver.cached()
                );
            }
            Outcome::Ignored => {
                log::debug!("[receiver] ignoring control segment seq={seq}");
            }
            Outcome::Reset => {
                log::warn!("[receiver] {peer} reset the connection");
                conn.close()?;
                return Err(ConnError::Reset);
            }
            Outcome::Delivered { acks, finished } => {
                for ack in acks {
                    send_ack(conn, ack, receiver.window_size()).await?;
                    log::debug!("[receiver] → ACK ack={ack}");
                }
                conn.set_rcv_nxt(receiver.ack_number());
                if finished {
                    break;
                }
            }
        }
    }

    conn.close()?;
    let bytes = receiver.bytes_delivered();
    let digest = receiver.into_digest();
    log::info!("[receiver] stream from {peer} complete: {bytes} bytes, md5 {digest}");
    Ok(Delivery {
        peer,
        bytes,
        digest,
    })
}

/// Next decodable datagram from `peer`.
async fn next_from(socket: &Socket, peer: SocketAddr) -> Result<Packet, ConnError> {
    loop {
        match socket.recv_from().await {
            Ok((pkt, addr)) if addr == peer => return Ok(pkt),
            Ok((_, addr)) => log::debug!("[receiver] ignoring datagram from stranger {addr}"),
            Err(SocketError::Packet(e)) => log::debug!("[receiver] discarding malformed datagram: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn send_ack(conn: &Connection, ack: u32, window: u16) -> Result<(), ConnError> {
    let mut pkt = Packet::control(conn.local_seq(), ack, flags::ACK);
    pkt.header.window = window;
    conn.socket().send_to(&mut pkt, conn.peer()).await?;
    Ok(())
}
