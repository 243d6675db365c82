//! Role coordinator.
//!
//! Sequences each side of the bootstrap: when local candidates are gathered,
//! when the remote description is published or awaited, and which agent entry
//! point finishes the job. The initiator serves the signaling endpoint and
//! accepts; the responder publishes to the peer and dials.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::agent::{AgentEvent, ConnectivityAgent, SessionHandle};
use crate::error::{SignalError, SignalResult};
use crate::session::SessionContext;
use crate::signaling;

/// Which side of the bootstrap this process plays. Fixed for the lifetime of
/// a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Serves the signaling endpoint, waits to learn the peer's credentials,
    /// then accepts the session.
    Initiator,
    /// Waits for operator confirmation, publishes its description to the
    /// peer's endpoint, then dials.
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First step of every role: publish local credentials into the shared
/// context, start the event pump, and begin candidate gathering.
pub async fn initialize(
    agent: &Arc<dyn ConnectivityAgent>,
    context: &SessionContext,
) -> SignalResult<JoinHandle<()>> {
    let (fragment, secret) = agent.local_credentials().await?;
    log::info!("Local credentials: fragment '{}'", fragment);
    context.set_credentials(&fragment, &secret);

    let events = agent.take_events()?;
    let pump = spawn_event_pump(events, context.clone());

    agent.gather_candidates().await?;
    Ok(pump)
}

/// Consume agent notifications: discovered candidates are appended to the
/// shared context, state transitions are logged.
fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    context: SessionContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::CandidateDiscovered(candidate) => {
                    log::info!("Local candidate: {}", candidate);
                    context.push_candidate(&candidate);
                }
                AgentEvent::StateChanged(state) => {
                    log::info!("Connection state changed: {}", state);
                }
            }
        }
    })
}

/// Initiator flow. The signaling server must already be running against the
/// same context and agent; remote candidates reach the agent through its
/// handler before the credentials arrive here.
pub async fn run_initiator(
    agent: Arc<dyn ConnectivityAgent>,
    context: SessionContext,
    mut handoff_rx: mpsc::Receiver<String>,
) -> SignalResult<SessionHandle> {
    let _pump = initialize(&agent, &context).await?;

    log::info!("Awaiting the peer's signaling request");
    let (fragment, secret) = signaling::recv_credentials(&mut handoff_rx).await?;
    log::info!("Learned remote credentials: fragment '{}'", fragment);

    agent.accept(&fragment, &secret).await
}

/// Responder flow. Blocks on the external readiness signal (a console prompt
/// in the binary), then runs the HTTP round trip.
pub async fn run_responder(
    agent: Arc<dyn ConnectivityAgent>,
    context: SessionContext,
    peer: &str,
    ready: oneshot::Receiver<()>,
) -> SignalResult<SessionHandle> {
    let _pump = initialize(&agent, &context).await?;

    ready.await.map_err(|_| {
        SignalError::Transport("operator readiness signal dropped before confirmation".into())
    })?;

    // Candidates discovered after this snapshot are not retransmitted; a
    // fast publish can lose late candidates for this exchange round.
    let local = context.snapshot();
    log::info!(
        "Publishing local description with {} candidate(s)",
        local.candidates.len()
    );
    let remote = signaling::exchange_descriptions(peer, &local).await?;
    log::info!("Learned remote credentials: fragment '{}'", remote.fragment);

    for candidate in &remote.candidates {
        agent.add_remote_candidate(candidate).await?;
    }
    agent.dial(&remote.fragment, &remote.secret).await
}

/// One round of the long-running accept side: wait for a credential pair
/// handed off by the re-keying signaling handler, then accept.
pub async fn next_accept_round(
    agent: &Arc<dyn ConnectivityAgent>,
    handoff_rx: &mut mpsc::Receiver<String>,
) -> SignalResult<SessionHandle> {
    let (fragment, secret) = signaling::recv_credentials(handoff_rx).await?;
    log::info!("Accept round with remote fragment '{}'", fragment);
    agent.accept(&fragment, &secret).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockAgent;
    use axum::routing::post;
    use axum::Router;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_fixture(body: &'static str) -> SocketAddr {
        let app = Router::new().route("/remoteAuth", post(move || async move { body }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture");
        let addr = listener.local_addr().expect("fixture addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("fixture server");
        });
        addr
    }

    async fn wait_for_candidates(context: &SessionContext, expected: &[&str]) {
        let expected: Vec<String> = expected.iter().map(|c| c.to_string()).collect();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if context.snapshot().candidates == expected {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("candidates should reach the context");
    }

    #[tokio::test]
    async fn test_initiator_accepts_handed_off_credentials() {
        let mock = Arc::new(MockAgent::new("u1", "p1").with_local_candidates(&["cand-local"]));
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();
        let context = SessionContext::new();
        let (handoff_tx, handoff_rx) = signaling::credential_handoff();

        // The peer's POST already delivered its credentials.
        handoff_tx.try_send("u2".to_string()).expect("fragment");
        handoff_tx.try_send("p2".to_string()).expect("secret");

        let handle = run_initiator(agent, context.clone(), handoff_rx)
            .await
            .expect("initiator run");
        assert_eq!(handle.local_addr().port(), 1000);

        assert_eq!(mock.accepts(), vec![("u2".to_string(), "p2".to_string())]);
        assert!(mock.dials().is_empty());

        let snapshot = context.snapshot();
        assert_eq!(snapshot.fragment, "u1");
        assert_eq!(snapshot.secret, "p1");
        wait_for_candidates(&context, &["cand-local"]).await;
    }

    #[tokio::test]
    async fn test_responder_adds_candidates_before_dialing() {
        let mock = Arc::new(MockAgent::new("u2", "p2"));
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();
        let context = SessionContext::new();
        let addr = spawn_fixture("fragment:\nu1\nsecret:\np1\ncandidate:\ncand-B\n").await;

        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).expect("signal readiness");

        run_responder(agent, context, &addr.to_string(), ready_rx)
            .await
            .expect("responder run");

        // Exactly one candidate fed to the agent, strictly before dial.
        assert_eq!(mock.ops(), vec!["gather", "add:cand-B", "dial:u1:p1"]);
    }

    #[tokio::test]
    async fn test_responder_unreachable_peer_is_transport_error() {
        let mock = Arc::new(MockAgent::new("u2", "p2"));
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();

        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).expect("signal readiness");

        let err = run_responder(agent, SessionContext::new(), &addr.to_string(), ready_rx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SignalError::Transport(_)));

        // Neither agent entry point was invoked.
        assert!(mock.accepts().is_empty());
        assert!(mock.dials().is_empty());
    }

    #[tokio::test]
    async fn test_responder_rejects_malformed_response() {
        let mock = Arc::new(MockAgent::new("u2", "p2"));
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();
        let addr = spawn_fixture("not a description").await;

        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).expect("signal readiness");

        let err = run_responder(agent, SessionContext::new(), &addr.to_string(), ready_rx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SignalError::MalformedDescription(_)));
        assert!(mock.dials().is_empty());
    }

    #[tokio::test]
    async fn test_initiator_propagates_accept_failure() {
        let mock = Arc::new(MockAgent::new("u1", "p1").fail_connect());
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();
        let (handoff_tx, handoff_rx) = signaling::credential_handoff();
        handoff_tx.try_send("u2".to_string()).expect("fragment");
        handoff_tx.try_send("p2".to_string()).expect("secret");

        let err = run_initiator(agent, SessionContext::new(), handoff_rx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SignalError::Agent(_)));
        assert_eq!(mock.accepts().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_round_ends_when_handoff_closes() {
        let mock = Arc::new(MockAgent::new("uS", "pS"));
        let agent: Arc<dyn ConnectivityAgent> = mock.clone();
        let (handoff_tx, mut handoff_rx) = signaling::credential_handoff();

        handoff_tx.try_send("uR".to_string()).expect("fragment");
        handoff_tx.try_send("pR".to_string()).expect("secret");
        next_accept_round(&agent, &mut handoff_rx)
            .await
            .expect("accept round");
        assert_eq!(mock.accepts(), vec![("uR".to_string(), "pR".to_string())]);

        drop(handoff_tx);
        let err = next_accept_round(&agent, &mut handoff_rx)
            .await
            .expect_err("closed hand-off must fail");
        assert!(matches!(err, SignalError::Transport(_)));
    }
}
