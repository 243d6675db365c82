//! Connectivity-agent contract.
//!
//! The agent is an external collaborator: it gathers candidates, runs
//! connectivity checks, and hands back an established session. This module
//! pins down the seam the coordinator and the signaling transport talk to;
//! the str0m-backed implementation lives in [`ice`]. Agent callbacks are
//! modeled as an event channel consumed by the coordinator rather than
//! direct mutation of shared state.

pub mod ice;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SignalError, SignalResult};

/// Connection state reported by the agent. Informational only: the
/// coordinator logs transitions but drives no decisions off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

/// Asynchronous notifications from the connectivity agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A local candidate was discovered during gathering, in serialized form.
    CandidateDiscovered(String),
    /// The connection state changed.
    StateChanged(ConnectionState),
}

/// Contract the connectivity-establishment collaborator must satisfy.
///
/// One agent instance serves one process run; `restart` re-keys it in place
/// for long-running accept sides.
#[async_trait]
pub trait ConnectivityAgent: Send + Sync {
    /// Local short-lived credentials `(fragment, secret)`. Read once before
    /// gathering begins; stable until `restart`.
    async fn local_credentials(&self) -> SignalResult<(String, String)>;

    /// Take the event stream. Yields each discovered candidate exactly once,
    /// plus state transitions. May only be taken once per agent.
    fn take_events(&self) -> SignalResult<mpsc::UnboundedReceiver<AgentEvent>>;

    /// Begin candidate gathering. Safe to invoke again after `restart`.
    async fn gather_candidates(&self) -> SignalResult<()>;

    /// Feed one remote candidate (serialized form) to the in-progress session.
    async fn add_remote_candidate(&self, candidate: &str) -> SignalResult<()>;

    /// Run connectivity checks as the receiving side.
    async fn accept(&self, remote_fragment: &str, remote_secret: &str)
        -> SignalResult<SessionHandle>;

    /// Run connectivity checks as the initiating side.
    async fn dial(&self, remote_fragment: &str, remote_secret: &str)
        -> SignalResult<SessionHandle>;

    /// Re-key: replace the local credentials and reset connectivity state,
    /// reusing this agent instance. A subsequent `gather_candidates` starts
    /// a fresh candidate generation.
    async fn restart(&self, fragment: &str, secret: &str) -> SignalResult<()>;
}

/// Established bidirectional session. Opaque to the coordinator: payloads go
/// in and out as datagrams, everything else stays inside the agent's driver
/// task. Dropping the handle tears the session down.
pub struct SessionHandle {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl SessionHandle {
    /// Assemble a handle from its driver-side channels. `outbound` payloads
    /// are transmitted to the peer; `inbound` carries received payloads.
    pub fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            local_addr,
            remote_addr,
            outbound,
            inbound,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Cloneable send side, so transmit and receive loops can run in
    /// separate tasks.
    pub fn sender(&self) -> SessionSender {
        SessionSender {
            outbound: self.outbound.clone(),
        }
    }

    pub async fn send(&self, payload: Vec<u8>) -> SignalResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| SignalError::Agent("session closed".into()))
    }

    /// Receive the next payload from the peer. Errors once the session's
    /// driver has shut down.
    pub async fn recv(&mut self) -> SignalResult<Vec<u8>> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| SignalError::Agent("session closed".into()))
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Send half of an established session.
#[derive(Clone)]
pub struct SessionSender {
    outbound: mpsc::Sender<Vec<u8>>,
}

impl SessionSender {
    pub async fn send(&self, payload: Vec<u8>) -> SignalResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| SignalError::Agent("session closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_handle_surfaces_closed_driver() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut handle = SessionHandle::new(
            "127.0.0.1:1000".parse().expect("addr"),
            "127.0.0.1:2000".parse().expect("addr"),
            out_tx,
            in_rx,
        );

        in_tx.send(b"ping".to_vec()).await.expect("queue inbound");
        assert_eq!(handle.recv().await.expect("recv"), b"ping".to_vec());

        // Driver going away closes both directions.
        drop(in_tx);
        drop(out_rx);
        assert!(handle.recv().await.is_err());
        assert!(handle.send(b"pong".to_vec()).await.is_err());
    }
}
