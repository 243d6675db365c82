//! Mock connectivity agent shared by unit tests.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::{AgentEvent, ConnectivityAgent, SessionHandle};
use crate::error::{SignalError, SignalResult};

/// Scripted agent that records every operation in call order.
pub struct MockAgent {
    fragment: String,
    secret: String,
    local_candidates: Vec<String>,
    reject_candidates: bool,
    fail_connect: bool,
    ops: StdMutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
}

impl MockAgent {
    pub fn new(fragment: &str, secret: &str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            fragment: fragment.to_string(),
            secret: secret.to_string(),
            local_candidates: Vec::new(),
            reject_candidates: false,
            fail_connect: false,
            ops: StdMutex::new(Vec::new()),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    /// Candidates emitted as discovery events when gathering starts.
    pub fn with_local_candidates(mut self, candidates: &[&str]) -> Self {
        self.local_candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn reject_candidates(mut self) -> Self {
        self.reject_candidates = true;
        self
    }

    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// All recorded operations, in call order.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().expect("ops lock").clone()
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.ops()
            .iter()
            .filter_map(|op| op.strip_prefix("add:").map(str::to_string))
            .collect()
    }

    pub fn accepts(&self) -> Vec<(String, String)> {
        self.credential_ops("accept:")
    }

    pub fn dials(&self) -> Vec<(String, String)> {
        self.credential_ops("dial:")
    }

    pub fn restarts(&self) -> Vec<(String, String)> {
        self.credential_ops("restart:")
    }

    pub fn gather_calls(&self) -> usize {
        self.ops().iter().filter(|op| op.as_str() == "gather").count()
    }

    fn credential_ops(&self, prefix: &str) -> Vec<(String, String)> {
        self.ops()
            .iter()
            .filter_map(|op| {
                let rest = op.strip_prefix(prefix)?;
                let (fragment, secret) = rest.split_once(':')?;
                Some((fragment.to_string(), secret.to_string()))
            })
            .collect()
    }

    fn record(&self, op: String) {
        self.ops.lock().expect("ops lock").push(op);
    }

    fn established_handle() -> SessionHandle {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel(8);
        SessionHandle::new(
            "127.0.0.1:1000".parse().expect("addr"),
            "127.0.0.1:2000".parse().expect("addr"),
            out_tx,
            in_rx,
        )
    }
}

#[async_trait]
impl ConnectivityAgent for MockAgent {
    async fn local_credentials(&self) -> SignalResult<(String, String)> {
        Ok((self.fragment.clone(), self.secret.clone()))
    }

    fn take_events(&self) -> SignalResult<mpsc::UnboundedReceiver<AgentEvent>> {
        self.events_rx
            .lock()
            .expect("events lock")
            .take()
            .ok_or_else(|| SignalError::Agent("agent events already taken".into()))
    }

    async fn gather_candidates(&self) -> SignalResult<()> {
        self.record("gather".to_string());
        for candidate in &self.local_candidates {
            let _ = self
                .events_tx
                .send(AgentEvent::CandidateDiscovered(candidate.clone()));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> SignalResult<()> {
        if self.reject_candidates {
            return Err(SignalError::candidate_parse(candidate, "rejected by test agent"));
        }
        self.record(format!("add:{}", candidate));
        Ok(())
    }

    async fn accept(
        &self,
        remote_fragment: &str,
        remote_secret: &str,
    ) -> SignalResult<SessionHandle> {
        self.record(format!("accept:{}:{}", remote_fragment, remote_secret));
        if self.fail_connect {
            return Err(SignalError::Agent("accept failed".into()));
        }
        Ok(Self::established_handle())
    }

    async fn dial(
        &self,
        remote_fragment: &str,
        remote_secret: &str,
    ) -> SignalResult<SessionHandle> {
        self.record(format!("dial:{}:{}", remote_fragment, remote_secret));
        if self.fail_connect {
            return Err(SignalError::Agent("dial failed".into()));
        }
        Ok(Self::established_handle())
    }

    async fn restart(&self, fragment: &str, secret: &str) -> SignalResult<()> {
        self.record(format!("restart:{}:{}", fragment, secret));
        Ok(())
    }
}
