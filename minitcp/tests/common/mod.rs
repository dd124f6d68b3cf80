//! Shared helpers for the integration tests.
//!
//! [`Script`] is a deterministic [`FaultModel`]: it records every datagram
//! it sees and applies whatever its plan names for that index.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minitcp::packet::Packet;
use minitcp::simulator::{FaultModel, Simulator, Verdict};
use minitcp::socket::Socket;

/// Upper bound on any single integration test step.
pub const STEP: Duration = Duration::from_secs(10);

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub async fn ephemeral() -> Socket {
    Socket::bind(loopback()).await.expect("bind failed")
}

/// Datagrams seen by one direction of a relay, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Tape(Arc<Mutex<Vec<Vec<u8>>>>);

impl Tape {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|d| Packet::decode(d).expect("relay saw a runt datagram"))
            .collect()
    }

    /// Flag bytes of every recorded packet.
    pub fn flags(&self) -> Vec<u8> {
        self.packets().iter().map(|p| p.header.flags).collect()
    }
}

#[derive(Debug, Default)]
pub struct Script {
    plan: HashMap<u64, Verdict>,
    corrupt: HashSet<u64>,
    tape: Tape,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the `n`th datagram (0-based).
    pub fn lose(mut self, n: u64) -> Self {
        self.plan.insert(n, Verdict::Drop);
        self
    }

    /// Hold the `n`th datagram back for `delay`.
    pub fn delay(mut self, n: u64, delay: Duration) -> Self {
        self.plan.insert(n, Verdict::Forward(delay));
        self
    }

    /// Flip a bit in the sequence field of the `n`th datagram, leaving its
    /// checksum stale.
    pub fn corrupt(mut self, n: u64) -> Self {
        self.corrupt.insert(n);
        self
    }

    pub fn tape(&self) -> Tape {
        self.tape.clone()
    }
}

impl FaultModel for Script {
    fn decide(&mut self, n: u64, datagram: &[u8]) -> Verdict {
        self.tape.0.lock().unwrap().push(datagram.to_vec());
        self.plan
            .get(&n)
            .copied()
            .unwrap_or(Verdict::Forward(Duration::ZERO))
    }

    fn tamper(&mut self, n: u64, datagram: &mut [u8]) {
        if self.corrupt.contains(&n) {
            datagram[7] ^= 0x01;
        }
    }
}

/// Relay between an already bound client and a server address.
///
/// The client must send to [`Simulator::a_addr`].  Returns the relay and
/// the tapes for the client-to-server and server-to-client directions.
pub async fn relay(
    client: SocketAddr,
    server: SocketAddr,
    upstream: Script,
    downstream: Script,
) -> (Simulator, Tape, Tape) {
    let up = upstream.tape();
    let down = downstream.tape();
    let sim = Simulator::start(loopback(), server, loopback(), client, upstream, downstream)
        .await
        .expect("start relay");
    (sim, up, down)
}

/// `len` bytes of a repeating non-trivial pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}
