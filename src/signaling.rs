//! HTTP signaling transport.
//!
//! One endpoint, `POST /remoteAuth`, carries the whole exchange: the peer
//! posts its encoded description as the `sdp` form field and the response
//! body is the local description in the same encoding. The handler is a
//! synchronous rendezvous: remote candidates reach the agent and the learned
//! credentials reach the coordinator before the response goes out.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::agent::ConnectivityAgent;
use crate::error::{SignalError, SignalResult};
use crate::session::{SessionContext, SessionDescription};

/// Hand-off channel capacity: room for exactly one credential pair.
pub const HANDOFF_CAPACITY: usize = 2;

/// Channel carrying credentials learned from an inbound signaling request to
/// the coordinator. Strict two-item sequence per exchange: fragment first,
/// then secret. Never reordered, never interleaved.
pub fn credential_handoff() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(HANDOFF_CAPACITY)
}

/// Consume one credential pair from the hand-off channel.
pub async fn recv_credentials(rx: &mut mpsc::Receiver<String>) -> SignalResult<(String, String)> {
    let fragment = rx.recv().await.ok_or_else(handoff_closed)?;
    let secret = rx.recv().await.ok_or_else(handoff_closed)?;
    Ok((fragment, secret))
}

fn handoff_closed() -> SignalError {
    SignalError::Transport("signaling hand-off channel closed".into())
}

/// State shared with the `/remoteAuth` handler.
#[derive(Clone)]
pub struct ServerState {
    context: SessionContext,
    agent: Arc<dyn ConnectivityAgent>,
    handoff: mpsc::Sender<String>,
    /// Serializes inbound exchanges so credential pairs never interleave.
    gate: Arc<Mutex<()>>,
    rekey: bool,
}

impl ServerState {
    pub fn new(
        context: SessionContext,
        agent: Arc<dyn ConnectivityAgent>,
        handoff: mpsc::Sender<String>,
    ) -> Self {
        Self {
            context,
            agent,
            handoff,
            gate: Arc::new(Mutex::new(())),
            rekey: false,
        }
    }

    /// Long-running variant: every inbound exchange re-keys the agent with
    /// the configured local credentials before candidates are gathered and
    /// returned.
    pub fn with_rekey(mut self) -> Self {
        self.rekey = true;
        self
    }
}

/// Serve the signaling endpoint on an already-bound listener.
pub async fn serve(listener: TcpListener, state: ServerState) -> SignalResult<()> {
    let app = Router::new()
        .route("/remoteAuth", post(remote_auth))
        .with_state(state);
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|err| SignalError::Transport(format!("signaling server failed: {}", err)))
}

#[derive(Deserialize)]
struct RemoteAuthForm {
    sdp: String,
}

async fn remote_auth(
    State(state): State<ServerState>,
    Form(form): Form<RemoteAuthForm>,
) -> Response {
    let _exchange = state.gate.lock().await;

    // Local credentials are set before gathering starts; an exchange arriving
    // earlier has nothing valid to answer with.
    let local = state.context.snapshot();
    if local.fragment.is_empty() || local.secret.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "local session not initialized".to_string(),
        )
            .into_response();
    }

    let remote = match SessionDescription::decode_strict(&form.sdp) {
        Ok(remote) => remote,
        Err(err) => {
            log::warn!("Rejecting signaling request: {}", err);
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    log::info!(
        "Signaling request from peer '{}' with {} candidate(s)",
        remote.fragment,
        remote.candidates.len()
    );

    if state.rekey {
        if let Err(err) = rekey(&state).await {
            log::error!("Session re-key failed: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    }

    for candidate in &remote.candidates {
        if let Err(err) = state.agent.add_remote_candidate(candidate).await {
            log::warn!("Rejecting signaling request: {}", err);
            let status = if err.is_request_scoped() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return (status, err.to_string()).into_response();
        }
    }

    let body = state.context.snapshot().encode();

    // Fragment first, then secret. A full channel means a completed exchange
    // already consumed this endpoint.
    if state.handoff.try_send(remote.fragment).is_err() {
        return (
            StatusCode::CONFLICT,
            "signaling exchange already completed".to_string(),
        )
            .into_response();
    }
    if state.handoff.try_send(remote.secret).is_err() {
        log::error!("Hand-off channel lost the secret half of a credential pair");
        return (
            StatusCode::CONFLICT,
            "signaling exchange already completed".to_string(),
        )
            .into_response();
    }

    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// Restart the agent under its current credentials and start a fresh
/// candidate generation. Candidates from the previous generation are dropped;
/// candidates still being discovered when the response snapshot is taken are
/// lost for this exchange round.
async fn rekey(state: &ServerState) -> SignalResult<()> {
    let local = state.context.snapshot();
    state.agent.restart(&local.fragment, &local.secret).await?;
    state.context.clear_candidates();
    state.agent.gather_candidates().await?;
    Ok(())
}

/// POST the local description to the peer's endpoint and decode the reply.
///
/// Any transport failure is surfaced as [`SignalError::Transport`]; the
/// one-shot flows treat that as fatal and never retry.
pub async fn exchange_descriptions(
    peer: &str,
    local: &SessionDescription,
) -> SignalResult<SessionDescription> {
    let url = format!("http://{}/remoteAuth", peer);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .form(&[("sdp", local.encode())])
        .send()
        .await
        .map_err(|err| SignalError::Transport(format!("POST {} failed: {}", url, err)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SignalError::Transport(format!(
            "peer returned {} for {}",
            status, url
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|err| SignalError::Transport(format!("failed to read response body: {}", err)))?;
    SessionDescription::decode_strict(&body)
}
