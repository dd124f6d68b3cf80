//! Outbound half of the reliable transfer engine.
//!
//! The client splits into two tasks once the handshake is done:
//!
//! ```text
//!            ┌──────────────┐  segments   ┌──────────┐
//!            │   Sender     │────────────▶│          │
//!            │ (this task)  │             │  server  │
//!            └──────▲───────┘             │          │
//!                   │ watch<AckProgress>  │          │
//!            ┌──────┴───────┐    ACKs     │          │
//!            │ monitor_acks │◀────────────│          │
//!            │  (spawned)   │             └──────────┘
//!            └──────────────┘
//! ```
//!
//! [`Sender`] owns the segmented stream and only sends; [`monitor_acks`]
//! only receives, folding cumulative ACKs into an [`AckProgress`] value the
//! sender watches.  Both share one `Arc<Socket>`.
//!
//! After the whole stream has been sent once, the sender waits for the
//! cumulative ACK to reach the end of the stream.  Each time a full
//! retransmission timeout passes without progress it resends every segment
//! from the current cumulative ACK onwards, up to `max_retries` rounds.
//! With `max_retries = 0` lost data is never resent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout_at, Instant};

use crate::connection::ConnError;
use crate::packet::{flags, seq_le, seq_lt, Header, Packet, HEADER_LEN};
use crate::socket::{Socket, SocketError};

/// Largest UDP payload over IPv4.
pub const MAX_MSS: usize = 65_507;

/// MSS used when the caller has no preference.
pub const DEFAULT_MSS: usize = 1020;

/// Gap between consecutive segments so a fast sender does not overrun the
/// receiver's socket buffer.  Not flow control.
pub const DEFAULT_PACING: Duration = Duration::from_millis(1);

/// Retransmission rounds for data before the sender gives up waiting.
pub const DEFAULT_DATA_RETRIES: u32 = 5;

/// Payload bytes that fit in one segment of `mss` total bytes.
pub fn data_per_segment(mss: usize) -> Result<usize, ConnError> {
    if mss <= HEADER_LEN || mss > MAX_MSS {
        return Err(ConnError::InvalidConfig(format!(
            "mss must be in {}..={MAX_MSS}, got {mss}",
            HEADER_LEN + 1
        )));
    }
    Ok(mss - HEADER_LEN)
}

/// Split `data` into segments of at most `mss` bytes each (header included).
///
/// Each segment's sequence number is `start_seq` plus the offset of its first
/// byte.  Only the last segment carries FIN.  An empty stream still yields one
/// (empty) FIN segment so the receiver learns that it has ended.
pub fn segment(data: &[u8], start_seq: u32, mss: usize) -> Result<Vec<Packet>, ConnError> {
    let per_segment = data_per_segment(mss)?;
    if data.is_empty() {
        return Ok(vec![Packet::control(start_seq, 0, flags::FIN)]);
    }

    let count = data.len().div_ceil(per_segment);
    let segments = data
        .chunks(per_segment)
        .enumerate()
        .map(|(i, chunk)| {
            let seq = start_seq.wrapping_add((i * per_segment) as u32);
            let bits = if i + 1 == count { flags::FIN } else { 0 };
            Packet::new(Header::new(seq, 0, bits), chunk.to_vec())
        })
        .collect();
    Ok(segments)
}

/// Sender-side tuning.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Total bytes per datagram, header included.
    pub mss: usize,
    /// Delay between consecutive segments.
    pub pacing: Duration,
    /// How long to wait for ACK progress before resending.
    pub retransmit_timeout: Duration,
    /// Retransmission rounds before giving up.
    pub max_retries: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            pacing: DEFAULT_PACING,
            retransmit_timeout: crate::connection::DEFAULT_HANDSHAKE_TIMEOUT,
            max_retries: DEFAULT_DATA_RETRIES,
        }
    }
}

/// What the ACK monitor has learned so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckProgress {
    /// Highest cumulative ACK seen (never moves backwards).
    pub acked: u32,
    /// Number of valid data ACKs received, duplicates included.
    pub acks_seen: u64,
    /// The peer sent RST.
    pub reset: bool,
}

impl AckProgress {
    pub fn new(start_seq: u32) -> Self {
        Self {
            acked: start_seq,
            acks_seen: 0,
            reset: false,
        }
    }

    /// Fold in a cumulative ACK.  ACKs behind the current value or past
    /// `end` are counted but do not move `acked`.
    pub fn record(&mut self, ack: u32, end: u32) {
        self.acks_seen += 1;
        if seq_lt(self.acked, ack) && seq_le(ack, end) {
            self.acked = ack;
        }
    }
}

/// Summary of one outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub bytes: usize,
    pub segments: usize,
    /// Segments sent more than once, counted per resend.
    pub retransmitted: usize,
    /// The peer acknowledged the end of the stream.
    pub fully_acknowledged: bool,
}

/// A segmented outbound stream.
#[derive(Debug)]
pub struct Sender {
    segments: Vec<Packet>,
    bytes: usize,
    start: u32,
    end: u32,
    config: SenderConfig,
}

impl Sender {
    pub fn new(data: &[u8], start_seq: u32, config: SenderConfig) -> Result<Self, ConnError> {
        let segments = segment(data, start_seq, config.mss)?;
        Ok(Self {
            segments,
            bytes: data.len(),
            start: start_seq,
            end: start_seq.wrapping_add(data.len() as u32),
            config,
        })
    }

    pub fn segments(&self) -> &[Packet] {
        &self.segments
    }

    pub fn start_seq(&self) -> u32 {
        self.start
    }

    /// Sequence number one past the last byte; the final cumulative ACK.
    pub fn end_seq(&self) -> u32 {
        self.end
    }

    /// `true` once `progress` shows the whole stream acknowledged.
    pub fn is_complete(&self, progress: &AckProgress) -> bool {
        progress.acked == self.end && progress.acks_seen > 0
    }

    /// Indices of segments not yet covered by cumulative ACK `acked`.
    pub fn unacked_from(&self, acked: u32) -> impl Iterator<Item = usize> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(move |(_, seg)| seg.payload.is_empty() || seq_lt(acked, seg.seq_end()))
            .map(|(i, _)| i)
    }

    /// Send the stream, then retransmit until it is acknowledged or the
    /// retry budget runs out.
    pub async fn run(
        mut self,
        socket: &Socket,
        peer: SocketAddr,
        mut progress: watch::Receiver<AckProgress>,
    ) -> Result<SendReport, ConnError> {
        let all: Vec<usize> = (0..self.segments.len()).collect();
        self.transmit(socket, peer, &all).await?;
        log::info!(
            "[sender] sent {} bytes in {} segment(s) to {peer}",
            self.bytes,
            self.segments.len()
        );

        let mut retransmitted = 0usize;
        let mut retries = 0u32;
        let mut last_acked = self.start;
        let mut deadline = Instant::now() + self.config.retransmit_timeout;

        let fully_acknowledged = loop {
            let seen = *progress.borrow_and_update();
            if seen.reset {
                return Err(ConnError::Reset);
            }
            if self.is_complete(&seen) {
                break true;
            }
            if seen.acked != last_acked {
                last_acked = seen.acked;
                retries = 0;
                deadline = Instant::now() + self.config.retransmit_timeout;
            }

            match timeout_at(deadline, progress.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    log::warn!("[sender] ACK monitor stopped before the stream was acknowledged");
                    break false;
                }
                Err(_elapsed) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        log::warn!(
                            "[sender] no ACK progress past {last_acked} after {} retransmission round(s)",
                            self.config.max_retries
                        );
                        break false;
                    }
                    let pending: Vec<usize> = self.unacked_from(last_acked).collect();
                    log::debug!(
                        "[sender] timeout at ack={last_acked}; resending {} segment(s) (round {retries})",
                        pending.len()
                    );
                    self.transmit(socket, peer, &pending).await?;
                    retransmitted += pending.len();
                    deadline = Instant::now() + self.config.retransmit_timeout;
                }
            }
        };

        Ok(SendReport {
            bytes: self.bytes,
            segments: self.segments.len(),
            retransmitted,
            fully_acknowledged,
        })
    }

    async fn transmit(
        &mut self,
        socket: &Socket,
        peer: SocketAddr,
        indices: &[usize],
    ) -> Result<(), ConnError> {
        for (n, &i) in indices.iter().enumerate() {
            if n > 0 && !self.config.pacing.is_zero() {
                sleep(self.config.pacing).await;
            }
            let seg = &mut self.segments[i];
            socket.send_to(seg, peer).await?;
            log::debug!("[sender] → DATA seq={} len={}", seg.header.seq, seg.payload.len());
        }
        Ok(())
    }
}

/// Receive ACKs from `peer` until told to stop, publishing progress on `tx`.
///
/// `handshake_ack` is re-sent whenever a duplicate SYN+ACK shows that the
/// peer missed the last leg of the handshake.  An RST marks the progress as
/// reset and ends the task.
pub async fn monitor_acks(
    socket: Arc<Socket>,
    peer: SocketAddr,
    mut handshake_ack: Packet,
    end: u32,
    tx: watch::Sender<AckProgress>,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), ConnError> {
    loop {
        let received = tokio::select! {
            _ = &mut stop => return Ok(()),
            r = socket.recv_from() => r,
        };
        let (pkt, addr) = match received {
            Ok(v) => v,
            Err(SocketError::Packet(e)) => {
                log::debug!("[monitor] discarding malformed datagram: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if addr != peer {
            continue;
        }
        if !pkt.validate_checksum() {
            log::debug!("[monitor] discarding corrupt ACK");
            continue;
        }

        let h = pkt.header;
        if h.has(flags::RST) {
            log::warn!("[monitor] peer reset the connection");
            tx.send_modify(|p| p.reset = true);
            return Ok(());
        }
        if h.has(flags::SYN | flags::ACK) {
            log::debug!("[monitor] duplicate SYN+ACK; repeating handshake ACK");
            socket.send_to(&mut handshake_ack, peer).await?;
            continue;
        }
        if h.has(flags::ACK) {
            tx.send_modify(|p| p.record(h.ack, end));
            log::debug!("[monitor] ← ACK ack={}", h.ack);
        }
    }
}
