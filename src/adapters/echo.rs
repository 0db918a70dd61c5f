//! In-process transports
//!
//! [`EchoTransport`] answers every request with a description of the request
//! itself, after an optional simulated latency. [`ScriptedTransport`] replays a
//! fixed sequence of outcomes and records what it was asked, which is what the
//! engine's tests drive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::domain::ports::{RequestSpec, Transport, TransportResponse};
use crate::error::{Error, Result};

/// Echoes the request back as the response body
#[derive(Debug, Default)]
pub struct EchoTransport {
    latency: Duration,
    requests: AtomicU64,
}

impl EchoTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            requests: AtomicU64::new(0),
        }
    }

    /// Requests served so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for EchoTransport {
    async fn request(&self, spec: RequestSpec) -> Result<TransportResponse> {
        let seq = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(TransportResponse::ok(json!({
            "method": spec.method.to_string(),
            "url": spec.full_url(),
            "headers": spec.headers,
            "body": spec.body,
            "seq": seq,
        })))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// One scripted outcome
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Respond with this body and status
    Respond { status: u16, data: Value },
    /// Fail with this error
    Fail(Error),
    /// Wait, then apply the inner outcome
    Delay(Duration, Box<Scripted>),
}

impl Scripted {
    pub fn ok(data: Value) -> Self {
        Scripted::Respond { status: 200, data }
    }

    pub fn status(status: u16) -> Self {
        Scripted::Respond {
            status,
            data: Value::Null,
        }
    }

    pub fn delayed(self, by: Duration) -> Self {
        Scripted::Delay(by, Box::new(self))
    }
}

/// Replays scripted outcomes in order, then falls back to a default
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    seen: Mutex<Vec<RequestSpec>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Scripted::ok(Value::Null),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Outcome used once the script runs out
    pub fn with_fallback(mut self, fallback: Scripted) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of requests received
    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    /// Requests received, in order
    pub fn requests(&self) -> Vec<RequestSpec> {
        self.seen.lock().clone()
    }

    pub fn push(&self, outcome: Scripted) {
        self.script.lock().push_back(outcome);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, spec: RequestSpec) -> Result<TransportResponse> {
        self.seen.lock().push(spec);
        let mut outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        loop {
            match outcome {
                Scripted::Respond { status, data } => {
                    return Ok(TransportResponse {
                        data,
                        status,
                        headers: Default::default(),
                    })
                }
                Scripted::Fail(error) => return Err(error),
                Scripted::Delay(by, inner) => {
                    tokio::time::sleep(by).await;
                    outcome = *inner;
                }
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
