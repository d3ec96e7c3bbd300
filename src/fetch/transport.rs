use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::fetch::error::FetchError;
use crate::fetch::request::OutboundRequest;

/// Status and raw body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Executes outbound requests. Shared by every attempt of every source.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, req: OutboundRequest) -> Result<RawResponse, FetchError>;
}

/// Production transport over a shared `reqwest::Client` with a fixed timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout.min(Duration::from_secs(4)))
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, req: OutboundRequest) -> Result<RawResponse, FetchError> {
        let mut builder = self
            .client
            .request(req.method, req.url)
            .headers(req.headers);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

// --- Test helper ---

/// One scripted reaction of [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum Step {
    Respond(u16, String),
    TransportError(String),
}

impl Step {
    pub fn json(v: serde_json::Value) -> Self {
        Step::Respond(200, v.to_string())
    }
}

/// Replays a fixed script of responses and records every request.
/// The last step repeats once the script runs out.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    pub requests: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new(vec![step])
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, req: OutboundRequest) -> Result<RawResponse, FetchError> {
        self.requests.lock().unwrap().push(req);
        let step = {
            let next = self.steps.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(s) => {
                    *last = Some(s.clone());
                    s
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Step::TransportError("empty script".into())),
            }
        };
        match step {
            Step::Respond(status, body) => Ok(RawResponse {
                status,
                body: body.into_bytes(),
            }),
            Step::TransportError(msg) => Err(FetchError::Transport(msg)),
        }
    }
}
