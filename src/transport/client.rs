use std::time::Duration;

use futures::StreamExt;
use reqwest::{Method, RequestBuilder, StatusCode, header};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::RunnerError;
use crate::config::OpenCodeConfig;
use crate::event::Answers;
use crate::protocol::emit::{CreateSessionBody, MessageBody, QuestionReply};
use crate::protocol::parse::SseDecoder;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "4096";
const DEFAULT_USERNAME: &str = "opencode";

/// Event-stream endpoints, tried in order.
const EVENT_PATHS: [&str; 2] = ["/event", "/global/event"];

/// Where the OpenCode server lives and how long to wait on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub base_url: String,
    pub username: String,
    pub password: Option<String>,
    /// Timeout for short requests. The message POST has none.
    pub http_timeout: Duration,
    /// Silence after the message POST completes before the run is finished.
    pub idle_timeout: Duration,
    /// How long a question callback may take before the question is rejected.
    pub question_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::resolve(&OpenCodeConfig::default(), |_| None)
    }
}

impl ServerSettings {
    /// Resolve from `OPENCODE_SERVER_*` variables, falling back to the config file.
    pub fn resolve(config: &OpenCodeConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let base_url = env("OPENCODE_SERVER_URL")
            .or_else(|| config.server_url.clone())
            .map_or_else(
                || {
                    let host = env("OPENCODE_SERVER_HOST").unwrap_or_else(|| DEFAULT_HOST.into());
                    let port = env("OPENCODE_SERVER_PORT").unwrap_or_else(|| DEFAULT_PORT.into());
                    format!("http://{host}:{port}")
                },
                |url| url.trim_end_matches('/').to_string(),
            );
        Self {
            base_url,
            username: env("OPENCODE_SERVER_USERNAME")
                .or_else(|| config.username.clone())
                .unwrap_or_else(|| DEFAULT_USERNAME.into()),
            password: env("OPENCODE_SERVER_PASSWORD").or_else(|| config.password.clone()),
            http_timeout: Duration::from_secs(config.http_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            question_timeout: Duration::from_secs(config.question_timeout_secs),
        }
    }
}

/// HTTP + SSE client for an OpenCode server.
#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    settings: ServerSettings,
}

impl OpenCodeClient {
    pub fn new(settings: ServerSettings) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.settings.base_url);
        let req = self.http.request(method, url);
        match &self.settings.password {
            Some(password) => req.basic_auth(&self.settings.username, Some(password)),
            None => req,
        }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<Value, RunnerError> {
        let mut req = self.request(Method::POST, path);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = resp.text().await?;
        if status.is_client_error() || status.is_server_error() {
            let detail = text.trim();
            let detail = if detail.is_empty() {
                status.canonical_reason().unwrap_or_default()
            } else {
                detail
            };
            return Err(RunnerError::Http {
                status: status.as_u16(),
                detail: detail.to_string(),
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Create a session that allows every tool, returning its id.
    pub async fn create_session(&self, title: Option<&str>) -> Result<String, RunnerError> {
        let body = CreateSessionBody::allow_all(title);
        let response = self
            .post("/session", Some(&body), Some(self.settings.http_timeout))
            .await?;
        ["id", "sessionID"]
            .iter()
            .filter_map(|k| response.get(*k).and_then(Value::as_str))
            .find(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(RunnerError::SessionCreate)
    }

    /// Post the prompt. Returns when the server has finished the turn.
    pub async fn send_message(
        &self,
        session_id: &str,
        body: &MessageBody,
    ) -> Result<Value, RunnerError> {
        self.post(&format!("/session/{session_id}/message"), Some(body), None)
            .await
    }

    pub async fn answer_question(
        &self,
        request_id: &str,
        answers: &Answers,
    ) -> Result<(), RunnerError> {
        self.post(
            &format!("/question/{request_id}/reply"),
            Some(&QuestionReply { answers }),
            Some(self.settings.http_timeout),
        )
        .await?;
        Ok(())
    }

    pub async fn reject_question(&self, request_id: &str) -> Result<(), RunnerError> {
        self.post::<Value>(
            &format!("/question/{request_id}/reject"),
            None,
            Some(self.settings.http_timeout),
        )
        .await?;
        Ok(())
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<(), RunnerError> {
        self.post::<Value>(
            &format!("/session/{session_id}/abort"),
            None,
            Some(self.settings.http_timeout),
        )
        .await?;
        Ok(())
    }

    /// Subscribe to the server's event stream and forward every JSON payload
    /// into `tx` until the stream ends or the receiver is dropped.
    pub async fn stream_events(&self, tx: mpsc::Sender<Value>) -> Result<(), RunnerError> {
        for path in EVENT_PATHS {
            let resp = match self
                .request(Method::GET, path)
                .header(header::ACCEPT, "text/event-stream")
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(path, error = %e, "SSE connect failed");
                    continue;
                }
            };
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                tracing::debug!(path, "SSE endpoint not found");
                continue;
            }
            if status.is_client_error() || status.is_server_error() {
                return Err(RunnerError::Http {
                    status: status.as_u16(),
                    detail: format!("event stream {path}"),
                });
            }
            tracing::debug!(path, "SSE connected");

            let mut decoder = SseDecoder::new();
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| RunnerError::Sse(e.to_string()))?;
                for payload in decoder.feed(&chunk) {
                    if tx.send(unwrap_global(payload)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            if let Some(payload) = decoder.finish() {
                let _ = tx.send(unwrap_global(payload)).await;
            }
            return Ok(());
        }
        Err(RunnerError::Sse(
            "failed to connect to OpenCode event stream".to_string(),
        ))
    }
}

/// `/global/event` wraps each event as `{directory, payload}`.
fn unwrap_global(value: Value) -> Value {
    match value {
        Value::Object(mut map) if !map.contains_key("type") && map.contains_key("payload") => {
            match map.remove("payload") {
                Some(inner @ Value::Object(_)) => inner,
                Some(other) => {
                    map.insert("payload".to_string(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            }
        }
        other => other,
    }
}
