//! Payload loop for an established session.
//!
//! Demo traffic: a random alphanumeric payload goes out on a fixed interval
//! while everything received is logged. Runs until the session ends.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::agent::SessionHandle;
use crate::error::SignalResult;

const PAYLOAD_LEN: usize = 15;
const SEND_INTERVAL: Duration = Duration::from_secs(3);

fn random_payload(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Drive an established session until it errors or the peer goes away.
pub async fn run(mut handle: SessionHandle) -> SignalResult<()> {
    log::info!("Local address: {}", handle.local_addr());
    log::info!("Remote address: {}", handle.remote_addr());

    let sender = handle.sender();
    let transmit = tokio::spawn(async move {
        let mut tick = tokio::time::interval(SEND_INTERVAL);
        loop {
            tick.tick().await;
            let payload = random_payload(PAYLOAD_LEN);
            if sender.send(payload.into_bytes()).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match handle.recv().await {
            Ok(payload) => log::debug!("Received {} byte(s)", payload.len()),
            Err(err) => break Err(err),
        }
    };
    transmit.abort();
    result
}
