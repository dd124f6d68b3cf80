//! Connection finite-state machine (FSM) types.
//!
//! The protocol only needs the opening half of the TCP state diagram plus a
//! return to `Closed` once the stream has been delivered:
//!
//! ```text
//!  active (client)                      passive (server)
//!
//!  Closed ──SYN sent──▶ SynSent         Closed ──▶ Listen ──SYN rcvd──▶ SynReceived
//!    ▲                     │                          ▲                     │
//!    └──timeout / reset────┤                          └──RST / bad ACK──────┤
//!                          │ SYN+ACK rcvd                                   │ ACK rcvd
//!                          ▼                                                ▼
//!                     Established ──FIN──▶ Closed            Established ──FIN──▶ Closed
//! ```
//!
//! Both roles share [`ConnectionState`]; which edges are legal depends on the
//! [`Role`].  [`StateMachine`] enforces them.

use std::fmt;

use thiserror::Error;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// Passive side waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received, SYN+ACK sent; waiting for the final ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Active open (client).
    Active,
    /// Passive open (server).
    Passive,
}

/// A transition the current [`Role`] is not allowed to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{role:?} role cannot move from {from} to {to}")]
pub struct StateError {
    pub role: Role,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Role {
    /// `true` when `from → to` is an edge of this role's diagram.
    ///
    /// Dropping back to `Closed` is always allowed (abandoned handshake,
    /// finished stream).
    pub fn allows(self, from: ConnectionState, to: ConnectionState) -> bool {
        use self::ConnectionState::*;
        if to == Closed {
            return true;
        }
        match self {
            Role::Active => matches!((from, to), (Closed, SynSent) | (SynSent, Established)),
            Role::Passive => matches!(
                (from, to),
                (Closed, Listen)
                    | (Listen, SynReceived)
                    | (SynReceived, Established)
                    | (SynReceived, Listen)
            ),
        }
    }
}

/// The per-connection state value, owned by whichever task drives it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    state: ConnectionState,
}

impl StateMachine {
    /// A fresh machine in [`ConnectionState::Closed`].
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Closed,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to`, rejecting edges the role does not have.
    pub fn advance(&mut self, to: ConnectionState) -> Result<(), StateError> {
        if !self.role.allows(self.state, to) {
            return Err(StateError {
                role: self.role,
                from: self.state,
                to,
            });
        }
        log::debug!("[{:?}] {} -> {}", self.role, self.state, to);
        self.state = to;
        Ok(())
    }
}
