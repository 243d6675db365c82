//! Session-description codec and shared local signaling state.
//!
//! The wire format is line-oriented and order-significant: a `fragment:`
//! marker line followed by the value line, a `secret:` marker/value pair,
//! then zero or more `candidate:` marker/value pairs. Values are taken
//! verbatim, so they must not contain newlines or a literal marker line.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{SignalError, SignalResult};

const FRAGMENT_MARKER: &str = "fragment:";
const SECRET_MARKER: &str = "secret:";
const CANDIDATE_MARKER: &str = "candidate:";

/// Credentials and candidates identifying one side of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Public half of the short-lived session credential.
    pub fragment: String,
    /// Shared-secret half of the short-lived session credential.
    pub secret: String,
    /// Serialized connectivity candidates, in discovery order.
    pub candidates: Vec<String>,
}

impl SessionDescription {
    pub fn new(fragment: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            secret: secret.into(),
            candidates: Vec::new(),
        }
    }

    /// Encode to the line-pair wire format.
    ///
    /// Credentials always precede candidates; candidate pairs keep insertion
    /// order so re-encoding is stable.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(FRAGMENT_MARKER);
        out.push('\n');
        out.push_str(&self.fragment);
        out.push('\n');
        out.push_str(SECRET_MARKER);
        out.push('\n');
        out.push_str(&self.secret);
        out.push('\n');
        for candidate in &self.candidates {
            out.push_str(CANDIDATE_MARKER);
            out.push('\n');
            out.push_str(candidate);
            out.push('\n');
        }
        out
    }

    /// Tolerant decode, wire-compatible with peers that send short or
    /// partially written descriptions: missing markers or truncated pairs
    /// yield partially-populated fields instead of an error.
    pub fn decode(text: &str) -> Self {
        let mut lines = text.lines();
        let mut desc = Self::default();

        if let Some(line) = lines.next() {
            if line == FRAGMENT_MARKER {
                desc.fragment = lines.next().unwrap_or_default().to_string();
            }
        }
        if let Some(line) = lines.next() {
            if line == SECRET_MARKER {
                desc.secret = lines.next().unwrap_or_default().to_string();
            }
        }
        while let Some(line) = lines.next() {
            if line == CANDIDATE_MARKER {
                if let Some(value) = lines.next() {
                    desc.candidates.push(value.to_string());
                }
            }
        }
        desc
    }

    /// Strict decode: same line-pair scan as [`decode`](Self::decode), but any
    /// missing marker, truncated pair, or unexpected line is an error instead
    /// of silently producing partial data.
    pub fn decode_strict(text: &str) -> SignalResult<Self> {
        let mut lines = text.lines();
        let mut desc = Self::default();

        desc.fragment = expect_pair(&mut lines, FRAGMENT_MARKER)?;
        desc.secret = expect_pair(&mut lines, SECRET_MARKER)?;
        while let Some(line) = lines.next() {
            if line != CANDIDATE_MARKER {
                return Err(SignalError::MalformedDescription(format!(
                    "expected '{}' marker, got '{}'",
                    CANDIDATE_MARKER, line
                )));
            }
            let value = lines.next().ok_or_else(|| {
                SignalError::MalformedDescription(format!(
                    "'{}' marker without a value line",
                    CANDIDATE_MARKER
                ))
            })?;
            desc.candidates.push(value.to_string());
        }
        Ok(desc)
    }
}

fn expect_pair<'a, I>(lines: &mut I, marker: &str) -> SignalResult<String>
where
    I: Iterator<Item = &'a str>,
{
    match lines.next() {
        Some(line) if line == marker => {}
        Some(line) => {
            return Err(SignalError::MalformedDescription(format!(
                "expected '{}' marker, got '{}'",
                marker, line
            )))
        }
        None => {
            return Err(SignalError::MalformedDescription(format!(
                "missing '{}' marker",
                marker
            )))
        }
    }
    let value = lines.next().ok_or_else(|| {
        SignalError::MalformedDescription(format!("'{}' marker without a value line", marker))
    })?;
    Ok(value.to_string())
}

/// Shared handle to the process-wide local [`SessionDescription`].
///
/// Owned by the role coordinator and cloned into the signaling server state
/// and the agent event pump. Exactly two writers exist: the initial
/// credentials step (sets fragment/secret once per key generation) and the
/// candidate pump (appends). Publish/respond steps read via [`snapshot`],
/// which hands out an immutable copy - candidates arriving after a snapshot
/// was transmitted are not retransmitted in that exchange round.
///
/// [`snapshot`]: SessionContext::snapshot
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    inner: Arc<Mutex<SessionDescription>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_credentials(&self, fragment: &str, secret: &str) {
        let mut desc = self.inner.lock().expect("session context poisoned");
        desc.fragment = fragment.to_string();
        desc.secret = secret.to_string();
    }

    pub fn push_candidate(&self, candidate: &str) {
        let mut desc = self.inner.lock().expect("session context poisoned");
        desc.candidates.push(candidate.to_string());
    }

    /// Drop candidates from a previous key generation. Used by the re-keying
    /// signaling handler before gathering starts over.
    pub fn clear_candidates(&self) {
        let mut desc = self.inner.lock().expect("session context poisoned");
        desc.candidates.clear();
    }

    /// Immutable copy of the current local description.
    pub fn snapshot(&self) -> SessionDescription {
        self.inner.lock().expect("session context poisoned").clone()
    }
}
