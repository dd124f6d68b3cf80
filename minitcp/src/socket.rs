//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`Packet`] instead of raw bytes.  It stamps the checksum on every outgoing
//! packet right before the bytes leave, and hands incoming packets back
//! unvalidated: whether a bad checksum means "send a duplicate ACK" or
//! "restart the handshake" is a protocol decision made elsewhere.
//!
//! Each socket owns one receive buffer sized from its MSS.  Datagrams longer
//! than the MSS are reported as [`PacketError::Oversize`] and never decoded.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::packet::{Packet, PacketError};

/// Largest datagram UDP can carry; the MSS of a socket bound with [`Socket::bind`].
pub const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be framed as a packet.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
}

/// An async, packet-oriented UDP socket.
///
/// All methods take `&self`, so one socket can be shared (behind an `Arc`)
/// between a sending task and a receiving task.  Receives are serialised on
/// the shared buffer.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    mss: usize,
    /// One byte longer than `mss` so an oversized datagram is detectable.
    buf: Mutex<Vec<u8>>,
}

impl Socket {
    /// Bind a new socket to `local_addr` that accepts datagrams of any size.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        Self::bind_with_mss(local_addr, MAX_DATAGRAM).await
    }

    /// Bind a socket that discards inbound datagrams longer than `mss` bytes.
    pub async fn bind_with_mss(local_addr: SocketAddr, mss: usize) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        let mss = mss.min(MAX_DATAGRAM);
        Ok(Self {
            local_addr,
            inner,
            mss,
            buf: Mutex::new(vec![0u8; mss + 1]),
        })
    }

    /// Largest datagram [`recv_from`](Self::recv_from) will decode.
    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Compute `packet`'s checksum and send it as one datagram to `dest`.
    pub async fn send_to(&self, packet: &mut Packet, dest: SocketAddr) -> Result<(), SocketError> {
        packet.compute_checksum();
        let bytes = packet.encode();
        self.inner.send_to(&bytes, dest).await?;
        log::trace!("→ {dest} {} len={}", packet.header, packet.payload.len());
        Ok(())
    }

    /// Receive the next datagram and split it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams shorter than a header
    /// or longer than the MSS come back as [`SocketError::Packet`]; the
    /// caller decides whether to keep listening.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = self.buf.lock().await;
        let (n, addr) = self.inner.recv_from(&mut buf[..]).await?;
        if n > self.mss {
            return Err(PacketError::Oversize { max: self.mss }.into());
        }
        let packet = Packet::decode(&buf[..n])?;
        log::trace!("← {addr} {} len={}", packet.header, packet.payload.len());
        Ok((packet, addr))
    }
}
