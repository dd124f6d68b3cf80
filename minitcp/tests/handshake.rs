//! Integration tests for the three-way handshake.
//!
//! Each test runs on real loopback sockets.  Lossy paths go through the
//! scripted relay from `common`; corrupted legs are produced by a raw
//! `tokio::net::UdpSocket` playing the other side by hand.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use minitcp::{
    connection::{ConnError, Connection, HandshakeConfig},
    packet::{flags, Packet},
    state::{ConnectionState, Role},
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use common::{ephemeral, loopback, relay, Script, STEP};

fn quick(timeout_ms: u64) -> HandshakeConfig {
    HandshakeConfig {
        timeout: Duration::from_millis(timeout_ms),
        ..HandshakeConfig::default()
    }
}

/// Encode `pkt` with a valid checksum.
fn wire(mut pkt: Packet) -> Vec<u8> {
    pkt.compute_checksum();
    pkt.encode()
}

/// Encode `pkt` with a valid checksum, then flip one header bit.
fn corrupted(pkt: Packet) -> Vec<u8> {
    let mut bytes = wire(pkt);
    bytes[7] ^= 0x01;
    bytes
}

async fn recv_packet(raw: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (len, from) = timeout(STEP, raw.recv_from(&mut buf))
        .await
        .expect("nothing arrived")
        .unwrap();
    (Packet::decode(&buf[..len]).unwrap(), from)
}

#[tokio::test]
async fn lossless_handshake_takes_exactly_three_datagrams() {
    let server_socket = ephemeral().await;
    let client_socket = ephemeral().await;
    let (sim, up, down) = relay(
        client_socket.local_addr,
        server_socket.local_addr,
        Script::new(),
        Script::new(),
    )
    .await;

    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(1000)).await });
    let client = timeout(STEP, Connection::connect(client_socket, sim.a_addr(), &quick(1000)))
        .await
        .expect("client connect timed out")
        .expect("client connect failed");
    let server = timeout(STEP, server)
        .await
        .expect("server accept timed out")
        .unwrap()
        .expect("server accept failed");

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.role(), Role::Active);
    assert_eq!(server.role(), Role::Passive);
    assert_eq!(up.flags(), vec![flags::SYN, flags::ACK]);
    assert_eq!(down.flags(), vec![flags::SYN | flags::ACK]);

    // Each side expects exactly what the other will send next.
    assert_eq!(server.rcv_nxt(), client.local_seq());
    assert_eq!(client.rcv_nxt(), server.local_seq());
}

#[tokio::test]
async fn dropped_syn_ack_is_retried_and_converges() {
    let server_socket = ephemeral().await;
    let client_socket = ephemeral().await;
    let (sim, up, _down) = relay(
        client_socket.local_addr,
        server_socket.local_addr,
        Script::new(),
        Script::new().lose(0),
    )
    .await;

    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(2000)).await });
    let client = timeout(STEP, Connection::connect(client_socket, sim.a_addr(), &quick(150)))
        .await
        .unwrap()
        .expect("client should converge after one lost SYN+ACK");
    let server = timeout(STEP, server).await.unwrap().unwrap().unwrap();

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(server.rcv_nxt(), client.local_seq());

    let sent = up.flags();
    assert_eq!(sent[0], flags::SYN);
    assert_eq!(sent[1], flags::RST, "timed-out attempt is reset");
    assert_eq!(sent[2], flags::SYN, "then the handshake restarts");
}

#[tokio::test]
async fn corrupted_syn_ack_draws_rst_and_a_fresh_syn() {
    let fake_server = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = fake_server.local_addr().unwrap();
    let client = tokio::spawn(async move {
        Connection::connect(ephemeral().await, server_addr, &quick(2000)).await
    });

    let (syn, client_addr) = recv_packet(&fake_server).await;
    assert_eq!(syn.header.flags, flags::SYN);
    let isn = syn.header.seq;
    let reply = Packet::control(9000, isn.wrapping_add(1), flags::SYN | flags::ACK);

    fake_server
        .send_to(&corrupted(reply.clone()), client_addr)
        .await
        .unwrap();
    let (rst, _) = recv_packet(&fake_server).await;
    assert_eq!(rst.header.flags, flags::RST);

    let (again, _) = recv_packet(&fake_server).await;
    assert_eq!(again.header.flags, flags::SYN);
    assert_eq!(again.header.seq, isn, "retries reuse the ISN");

    fake_server.send_to(&wire(reply), client_addr).await.unwrap();
    let (ack, _) = recv_packet(&fake_server).await;
    assert_eq!(ack.header.flags, flags::ACK);
    assert_eq!(ack.header.ack, 9001);

    let conn = timeout(STEP, client).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(conn.local_seq(), isn.wrapping_add(1));
}

#[tokio::test]
async fn rst_from_server_is_not_answered_with_rst() {
    let fake_server = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = fake_server.local_addr().unwrap();
    let client = tokio::spawn(async move {
        Connection::connect(ephemeral().await, server_addr, &quick(2000)).await
    });

    let (syn, client_addr) = recv_packet(&fake_server).await;
    fake_server
        .send_to(&wire(Packet::control(0, 0, flags::RST)), client_addr)
        .await
        .unwrap();

    let (next, _) = recv_packet(&fake_server).await;
    assert_eq!(next.header.flags, flags::SYN);

    let reply = Packet::control(5, syn.header.seq.wrapping_add(1), flags::SYN | flags::ACK);
    fake_server.send_to(&wire(reply), client_addr).await.unwrap();
    let conn = timeout(STEP, client).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.rcv_nxt(), 6);
}

#[tokio::test]
async fn syn_ack_with_wrong_ack_number_is_rejected() {
    let fake_server = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = fake_server.local_addr().unwrap();
    let client = tokio::spawn(async move {
        Connection::connect(ephemeral().await, server_addr, &quick(2000)).await
    });

    let (syn, client_addr) = recv_packet(&fake_server).await;
    let wrong = Packet::control(5, syn.header.seq.wrapping_add(2), flags::SYN | flags::ACK);
    fake_server.send_to(&wire(wrong), client_addr).await.unwrap();

    let (rst, _) = recv_packet(&fake_server).await;
    assert_eq!(rst.header.flags, flags::RST);
    client.abort();
}

#[tokio::test]
async fn corrupted_final_ack_draws_rst_and_server_listens_again() {
    let server_socket = ephemeral().await;
    let server_addr = server_socket.local_addr;
    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(2000)).await });

    let fake_client = UdpSocket::bind(loopback()).await.unwrap();
    fake_client
        .send_to(&wire(Packet::control(100, 0, flags::SYN)), server_addr)
        .await
        .unwrap();
    let (syn_ack, _) = recv_packet(&fake_client).await;
    assert_eq!(syn_ack.header.flags, flags::SYN | flags::ACK);
    assert_eq!(syn_ack.header.ack, 101);
    let server_isn = syn_ack.header.seq;

    let final_ack = Packet::control(101, server_isn.wrapping_add(1), flags::ACK);
    fake_client
        .send_to(&corrupted(final_ack.clone()), server_addr)
        .await
        .unwrap();
    let (rst, _) = recv_packet(&fake_client).await;
    assert_eq!(rst.header.flags, flags::RST);
    assert!(!server.is_finished(), "server must not be established");

    // Back in Listen: a fresh SYN starts over.
    fake_client
        .send_to(&wire(Packet::control(100, 0, flags::SYN)), server_addr)
        .await
        .unwrap();
    let (syn_ack, _) = recv_packet(&fake_client).await;
    assert_eq!(syn_ack.header.flags, flags::SYN | flags::ACK);
    fake_client.send_to(&wire(final_ack), server_addr).await.unwrap();

    let conn = timeout(STEP, server).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(conn.peer(), fake_client.local_addr().unwrap());
    assert_eq!(conn.rcv_nxt(), 101);
}

#[tokio::test]
async fn server_ignores_corrupt_syn() {
    let server_socket = ephemeral().await;
    let server_addr = server_socket.local_addr;
    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(2000)).await });

    let fake_client = UdpSocket::bind(loopback()).await.unwrap();
    fake_client
        .send_to(&corrupted(Packet::control(100, 0, flags::SYN)), server_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let silence = timeout(Duration::from_millis(200), fake_client.recv_from(&mut buf)).await;
    assert!(silence.is_err(), "corrupt SYN must not be answered");
    server.abort();
}

#[tokio::test]
async fn server_resends_syn_ack_when_final_ack_is_lost() {
    let server_socket = ephemeral().await;
    let server_addr = server_socket.local_addr;
    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(100)).await });

    let fake_client = UdpSocket::bind(loopback()).await.unwrap();
    fake_client
        .send_to(&wire(Packet::control(7, 0, flags::SYN)), server_addr)
        .await
        .unwrap();
    let (first, _) = recv_packet(&fake_client).await;
    let (second, _) = recv_packet(&fake_client).await;
    assert_eq!(first, second, "SYN+ACK is retransmitted unchanged");

    fake_client
        .send_to(
            &wire(Packet::control(8, first.header.seq.wrapping_add(1), flags::ACK)),
            server_addr,
        )
        .await
        .unwrap();
    let conn = timeout(STEP, server).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);
}

#[tokio::test]
async fn data_in_place_of_the_final_ack_completes_the_handshake() {
    let server_socket = ephemeral().await;
    let server_addr = server_socket.local_addr;
    let server = tokio::spawn(async move { Connection::accept(server_socket, &quick(2000)).await });

    let fake_client = UdpSocket::bind(loopback()).await.unwrap();
    fake_client
        .send_to(&wire(Packet::control(7, 0, flags::SYN)), server_addr)
        .await
        .unwrap();
    recv_packet(&fake_client).await;

    let data = Packet::new(minitcp::packet::Header::new(8, 0, 0), b"hello".to_vec());
    fake_client.send_to(&wire(data), server_addr).await.unwrap();
    let conn = timeout(STEP, server).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);
}

#[tokio::test]
async fn silent_peer_fails_after_max_attempts() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let config = HandshakeConfig {
        timeout: Duration::from_millis(40),
        max_attempts: 3,
        initial_seq: Some(1),
    };

    let result = timeout(
        STEP,
        Connection::connect(ephemeral().await, silent.local_addr().unwrap(), &config),
    )
    .await
    .unwrap();
    assert!(
        matches!(result, Err(ConnError::HandshakeFailed { attempts: 3 })),
        "expected HandshakeFailed, got: {result:?}"
    );

    // Three SYN/RST pairs, nothing else.
    let mut seen = Vec::new();
    let mut buf = [0u8; 64];
    while let Ok(Ok((len, _))) =
        timeout(Duration::from_millis(100), silent.recv_from(&mut buf)).await
    {
        seen.push(Packet::decode(&buf[..len]).unwrap().header.flags);
    }
    assert_eq!(
        seen,
        vec![flags::SYN, flags::RST, flags::SYN, flags::RST, flags::SYN, flags::RST]
    );
}
