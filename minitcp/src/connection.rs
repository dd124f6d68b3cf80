//! Per-connection lifecycle: the three-way handshake in both roles.
//!
//! A [`Connection`] is what a successful handshake produces: an
//! `Established` state machine, the socket, the peer address, and the
//! synchronised sequence numbers.  [`crate::sender`] and
//! [`crate::receiver`] take it from there.
//!
//! ```text
//!  client (connect)                          server (accept)
//!  Closed                                    Listen
//!    │ ── SYN seq=ISNc ─────────────────────▶  │
//!  SynSent                                   SynReceived
//!    │ ◀──────── SYN+ACK seq=ISNs ack=ISNc+1 ─ │
//!  Established                                 │
//!    │ ── ACK seq=ISNc+1 ack=ISNs+1 ────────▶  │
//!    │                                       Established
//! ```
//!
//! Every failure path restarts the handshake from the top, in a bounded
//! loop: the client gives up with [`ConnError::HandshakeFailed`] after
//! [`HandshakeConfig::max_attempts`] attempts, while the server simply goes
//! back to listening.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::packet::{flags, Packet};
use crate::socket::{Socket, SocketError};
use crate::state::{ConnectionState, Role, StateError, StateMachine};
use crate::timer::{RetransmitTimer, Wait};

/// Default handshake retransmission timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default cap on handshake attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Handshake tuning shared by both roles.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long to wait for each reply before retransmitting.
    pub timeout: Duration,
    /// Client: SYNs sent before giving up.  Server: SYN+ACKs sent per
    /// incoming SYN before returning to `Listen`.
    pub max_attempts: u32,
    /// Initial sequence number; random when `None`.
    pub initial_seq: Option<u32>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_seq: None,
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Result<(), ConnError> {
        if self.max_attempts == 0 {
            return Err(ConnError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConnError::InvalidConfig("handshake timeout must be non-zero".into()));
        }
        Ok(())
    }

    fn isn(&self) -> u32 {
        self.initial_seq.unwrap_or_else(rand::random)
    }
}

/// Errors surfaced by connection-level operations.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("handshake failed after {attempts} attempt(s)")]
    HandshakeFailed { attempts: u32 },
    #[error("connection reset by peer")]
    Reset,
    #[error("connection is {actual}, operation needs {expected}")]
    BadState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a handshake leg was rejected.  Always recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFault {
    /// No reply before the retransmission timer expired.
    Timeout,
    /// Checksum mismatch or a datagram too short to frame.
    Corrupt,
    /// The peer reset the attempt.
    Reset,
    /// Valid packet, wrong control flags for this leg.
    UnexpectedFlags(u8),
    /// SYN+ACK that does not acknowledge our SYN.
    WrongAck { expected: u32, got: u32 },
}

impl fmt::Display for HandshakeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Corrupt => f.write_str("corrupt packet"),
            Self::Reset => f.write_str("reset by peer"),
            Self::UnexpectedFlags(bits) => write!(f, "unexpected control flags {bits:#08b}"),
            Self::WrongAck { expected, got } => write!(f, "ack {got}, expected {expected}"),
        }
    }
}

/// Check the reply to our SYN.  It must be a valid, exact SYN+ACK for `isn`.
pub fn check_syn_ack(wait: Wait, isn: u32) -> Result<Packet, HandshakeFault> {
    let pkt = match wait {
        Wait::Expired => return Err(HandshakeFault::Timeout),
        Wait::Malformed(_) => return Err(HandshakeFault::Corrupt),
        Wait::Received(pkt, _) => pkt,
    };
    if !pkt.validate_checksum() {
        return Err(HandshakeFault::Corrupt);
    }
    if pkt.header.has(flags::RST) {
        return Err(HandshakeFault::Reset);
    }
    if pkt.header.flags != flags::SYN | flags::ACK {
        return Err(HandshakeFault::UnexpectedFlags(pkt.header.flags));
    }
    let expected = isn.wrapping_add(1);
    if pkt.header.ack != expected {
        return Err(HandshakeFault::WrongAck {
            expected,
            got: pkt.header.ack,
        });
    }
    Ok(pkt)
}

/// Check the segment that should complete a passive open.
///
/// A valid ACK completes it.  So does a data segment: the peer only sends
/// data once established, so its final ACK was lost or overtaken.  That
/// segment is returned so the receiver still gets it.
pub fn check_final_ack(wait: Wait) -> Result<Option<Packet>, HandshakeFault> {
    let pkt = match wait {
        Wait::Expired => return Err(HandshakeFault::Timeout),
        Wait::Malformed(_) => return Err(HandshakeFault::Corrupt),
        Wait::Received(pkt, _) => pkt,
    };
    if !pkt.validate_checksum() {
        return Err(HandshakeFault::Corrupt);
    }
    if pkt.header.has(flags::RST) {
        return Err(HandshakeFault::Reset);
    }
    if pkt.header.has(flags::ACK) {
        return Ok(None);
    }
    let is_data = !pkt.payload.is_empty() || pkt.header.has(flags::FIN);
    if pkt.header.flags & !flags::FIN == 0 && is_data {
        return Ok(Some(pkt));
    }
    Err(HandshakeFault::UnexpectedFlags(pkt.header.flags))
}

/// A connection that has completed the three-way handshake.
#[derive(Debug)]
pub struct Connection {
    fsm: StateMachine,
    socket: Arc<Socket>,
    peer: SocketAddr,
    /// Next sequence number this side sends (`ISN + 1` after the handshake).
    local_seq: u32,
    /// Next sequence number expected from the peer; the last ACK sent.
    rcv_nxt: u32,
    /// Data segment that completed a passive open in place of the ACK.
    early: Option<Packet>,
}

impl Connection {
    /// Active open (client side).
    ///
    /// Sends a SYN and waits for SYN+ACK.  On timeout, corruption, or wrong
    /// flags the attempt is reset (RST) and the whole handshake starts
    /// again with the same ISN.  An RST from the peer restarts without
    /// answering it.
    pub async fn connect(
        socket: impl Into<Arc<Socket>>,
        peer: SocketAddr,
        config: &HandshakeConfig,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let socket: Arc<Socket> = socket.into();
        let timer = RetransmitTimer::new(config.timeout);
        let isn = config.isn();
        let mut fsm = StateMachine::new(Role::Active);

        for attempt in 1..=config.max_attempts {
            let mut syn = Packet::control(isn, 0, flags::SYN);
            socket.send_to(&mut syn, peer).await?;
            fsm.advance(ConnectionState::SynSent)?;
            log::debug!(
                "[client] → SYN seq={isn} (attempt {attempt}/{}, waiting {:?})",
                config.max_attempts,
                timer.timeout()
            );

            let wait = timer.wait(&socket, Some(peer)).await?;
            match check_syn_ack(wait, isn) {
                Ok(syn_ack) => {
                    fsm.advance(ConnectionState::Established)?;
                    let local_seq = isn.wrapping_add(1);
                    let rcv_nxt = syn_ack.header.seq.wrapping_add(1);
                    let mut ack = Packet::control(local_seq, rcv_nxt, flags::ACK);
                    socket.send_to(&mut ack, peer).await?;
                    log::info!("[client] connection established with {peer}");
                    log::debug!("[client] ← SYN+ACK seq={}; → ACK ack={rcv_nxt}", syn_ack.header.seq);
                    return Ok(Self {
                        fsm,
                        socket,
                        peer,
                        local_seq,
                        rcv_nxt,
                        early: None,
                    });
                }
                Err(fault) => {
                    log::debug!("[client] handshake attempt {attempt} failed: {fault}; restarting");
                    if fault != HandshakeFault::Reset {
                        let mut rst = Packet::control(isn, 0, flags::RST);
                        socket.send_to(&mut rst, peer).await?;
                    }
                    fsm.advance(ConnectionState::Closed)?;
                }
            }
        }

        log::warn!("[client] giving up on {peer} after {} attempts", config.max_attempts);
        Err(ConnError::HandshakeFailed {
            attempts: config.max_attempts,
        })
    }

    /// Passive open (server side).
    ///
    /// Listens until a valid SYN arrives, adopts its sender as the peer,
    /// and answers with SYN+ACK.  A corrupt or wrongly flagged reply draws
    /// an RST; any failure sends the server back to `Listen`.  Only a
    /// socket error ends the call without a connection.
    ///
    /// Passing an `Arc<Socket>` keeps the listening socket usable after the
    /// connection is dropped.
    pub async fn accept(
        socket: impl Into<Arc<Socket>>,
        config: &HandshakeConfig,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let socket: Arc<Socket> = socket.into();
        let timer = RetransmitTimer::new(config.timeout);
        let isn = config.isn();
        let mut fsm = StateMachine::new(Role::Passive);
        fsm.advance(ConnectionState::Listen)?;
        log::debug!("[server] listening on {}", socket.local_addr);

        loop {
            let (syn, peer) = await_syn(&socket).await?;
            fsm.advance(ConnectionState::SynReceived)?;
            let rcv_nxt = syn.header.seq.wrapping_add(1);
            let mut syn_ack = Packet::control(isn, rcv_nxt, flags::SYN | flags::ACK);

            let mut fault = HandshakeFault::Timeout;
            for attempt in 1..=config.max_attempts {
                socket.send_to(&mut syn_ack, peer).await?;
                log::debug!("[server] → SYN+ACK to {peer} seq={isn} ack={rcv_nxt} (attempt {attempt})");

                let wait = timer.wait(&socket, Some(peer)).await?;
                if matches!(wait, Wait::Expired) {
                    continue;
                }
                match check_final_ack(wait) {
                    Ok(early) => {
                        if early.is_some() {
                            log::debug!("[server] data from {peer} before the final ACK");
                        }
                        fsm.advance(ConnectionState::Established)?;
                        log::info!("[server] connection established with {peer}");
                        return Ok(Self {
                            fsm,
                            socket,
                            peer,
                            local_seq: isn.wrapping_add(1),
                            rcv_nxt,
                            early,
                        });
                    }
                    Err(f) => {
                        fault = f;
                        break;
                    }
                }
            }

            log::debug!("[server] handshake with {peer} failed: {fault}; listening again");
            if matches!(
                fault,
                HandshakeFault::Corrupt | HandshakeFault::UnexpectedFlags(_)
            ) {
                let mut rst = Packet::control(isn, 0, flags::RST);
                socket.send_to(&mut rst, peer).await?;
            }
            fsm.advance(ConnectionState::Listen)?;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub fn role(&self) -> Role {
        self.fsm.role()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// A second handle on the socket for a concurrently running task.
    pub fn shared_socket(&self) -> Arc<Socket> {
        Arc::clone(&self.socket)
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Take the segment that arrived in place of the final handshake ACK.
    pub(crate) fn take_early_segment(&mut self) -> Option<Packet> {
        self.early.take()
    }

    pub(crate) fn set_rcv_nxt(&mut self, rcv_nxt: u32) {
        self.rcv_nxt = rcv_nxt;
    }

    /// Fail with [`ConnError::BadState`] unless the connection is in `expected`.
    pub fn require(&self, expected: ConnectionState) -> Result<(), ConnError> {
        let actual = self.state();
        if actual != expected {
            return Err(ConnError::BadState { expected, actual });
        }
        Ok(())
    }

    /// Drop back to `Closed`.
    pub fn close(&mut self) -> Result<(), ConnError> {
        self.fsm.advance(ConnectionState::Closed)?;
        Ok(())
    }
}

/// Block in `Listen` until a valid SYN arrives.
async fn await_syn(socket: &Socket) -> Result<(Packet, SocketAddr), ConnError> {
    loop {
        let (pkt, addr) = match socket.recv_from().await {
            Ok(v) => v,
            Err(SocketError::Packet(e)) => {
                log::debug!("[server] discarding malformed datagram: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !pkt.validate_checksum() {
            log::debug!("[server] discarding corrupt packet from {addr} while waiting for SYN");
        } else if pkt.header.has(flags::RST) {
            log::debug!("[server] ignoring RST from {addr} while listening");
        } else if !pkt.header.has(flags::SYN) {
            log::debug!("[server] discarding non-SYN from {addr}: {}", pkt.header);
        } else {
            log::debug!("[server] ← SYN from {addr} seq={}", pkt.header.seq);
            return Ok((pkt, addr));
        }
    }
}
