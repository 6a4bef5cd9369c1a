use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::RunnerError;
use crate::event::{Event, Failure, FailureKind, Question};
use crate::normalize::Normalize;
use crate::normalize::envelope::{coerce_event, extract_session_id};
use crate::protocol::emit::MessageBody;
use crate::runner::QuestionCallback;
use crate::runner::stream::{CancelToken, RunSink, RunStream};
use crate::session::state::RunState;

use super::client::OpenCodeClient;

/// How often the driving loop wakes to check cancellation and timers.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Capacity of the queue between the event-stream task and the driving loop.
const PAYLOAD_QUEUE: usize = 1024;

/// One prompt submission against the service.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Resume this session instead of creating one.
    pub continuation_id: Option<String>,
    /// Title for a newly created session.
    pub title: Option<String>,
    pub message: MessageBody,
}

/// Drives a session-oriented HTTP service: event stream in, prompt out,
/// questions answered in between.
#[derive(Clone)]
pub struct ServiceStreamDriver {
    pub client: OpenCodeClient,
    pub normalizer: Arc<dyn Normalize>,
    pub question_callback: Option<QuestionCallback>,
}

enum Polled {
    Payload(Value),
    Idle,
    Closed,
}

enum Outcome {
    /// The normalizer produced a terminal event.
    Finished,
    Cancelled,
    IdleTimeout,
    Failed(Failure),
}

impl ServiceStreamDriver {
    pub fn start(&self, request: ServiceRequest, cancel: CancelToken) -> RunStream {
        let (sink, stream) = RunStream::channel();
        tokio::spawn(self.clone().drive(request, cancel, sink));
        stream
    }

    async fn drive(self, request: ServiceRequest, mut cancel: CancelToken, sink: RunSink) {
        let mut state = RunState::default();

        let session_id = match request.continuation_id {
            Some(id) => id,
            None => {
                let created = tokio::select! {
                    () = cancel.cancelled() => Err(None),
                    created = self.client.create_session(request.title.as_deref()) => created.map_err(Some),
                };
                match created {
                    Ok(id) => id,
                    Err(err) => {
                        let failure = err.map_or_else(Failure::cancelled, |e: RunnerError| {
                            tracing::error!(error = %e, "OpenCode session creation failed");
                            e.to_failure()
                        });
                        if let Some(event) = state.finish_with_error(failure) {
                            sink.emit(event).await;
                        }
                        sink.complete(state.summary());
                        return;
                    }
                }
            }
        };
        if state.observe_session_id(&session_id) {
            sink.emit(Event::SessionId(session_id.clone())).await;
        }

        let (payload_tx, mut payload_rx) = mpsc::channel(PAYLOAD_QUEUE);
        let sse_client = self.client.clone();
        let mut sse_task = tokio::spawn(async move { sse_client.stream_events(payload_tx).await });
        let post_client = self.client.clone();
        let post_session = session_id.clone();
        let mut message_task = tokio::spawn(async move {
            post_client
                .send_message(&post_session, &request.message)
                .await
        });

        let idle_timeout = self.client.settings().idle_timeout;
        let mut sse_done = false;
        let mut message_done = false;
        let mut queue_open = true;
        let mut idle_seen = false;
        let mut last_event_at = Instant::now();

        let outcome = 'run: loop {
            if cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            if !sse_done && sse_task.is_finished() {
                sse_done = true;
                if let Some(failure) = task_failure(&mut sse_task).await {
                    break Outcome::Failed(failure);
                }
                tracing::debug!("OpenCode event stream ended");
            }
            if !message_done && message_task.is_finished() {
                message_done = true;
                if let Some(failure) = task_failure(&mut message_task).await {
                    break Outcome::Failed(failure);
                }
                last_event_at = last_event_at.max(Instant::now());
            }
            if message_done && idle_seen && !state.is_terminal() {
                if let Some(event) = state.finish_with_result() {
                    sink.emit(event).await;
                }
            }
            if message_done && state.is_terminal() {
                break Outcome::Finished;
            }
            if message_done && last_event_at.elapsed() >= idle_timeout {
                break Outcome::IdleTimeout;
            }

            let polled = tokio::select! {
                () = cancel.cancelled() => break 'run Outcome::Cancelled,
                polled = poll_queue(&mut payload_rx, queue_open) => polled,
            };
            let payload = match polled {
                Polled::Payload(payload) => payload,
                Polled::Idle => continue,
                Polled::Closed => {
                    queue_open = false;
                    continue;
                }
            };

            if let Some(id) = extract_session_id(&payload)
                && id != session_id
            {
                continue;
            }
            let Some(event) = coerce_event(&payload) else {
                continue;
            };
            match event.get("type").and_then(Value::as_str) {
                Some("session.idle") => {
                    idle_seen = true;
                    last_event_at = Instant::now();
                    continue;
                }
                Some("permission.requested") => {
                    tracing::debug!(payload = %event, "permission request ignored");
                    continue;
                }
                _ => {}
            }

            if state.is_terminal() {
                continue;
            }
            let events = self.normalizer.normalize(&event, &mut state);
            if events.is_empty() {
                continue;
            }
            last_event_at = Instant::now();
            for event in events {
                let question = match &event {
                    Event::Question(q) => Some(q.clone()),
                    _ => None,
                };
                if !sink.emit(event).await {
                    break 'run Outcome::Cancelled;
                }
                if let Some(question) = question {
                    self.resolve_question(question, &mut cancel).await;
                    last_event_at = Instant::now();
                }
            }
        };

        sse_task.abort();
        message_task.abort();

        let terminal = match outcome {
            Outcome::Finished => None,
            Outcome::Failed(failure) => {
                tracing::error!(message = %failure.message, "OpenCode run failed");
                state.finish_with_error(failure)
            }
            Outcome::Cancelled => {
                if let Err(e) = self.client.abort_session(&session_id).await {
                    tracing::debug!(error = %e, %session_id, "session abort failed");
                }
                state.finish_with_error(Failure::cancelled())
            }
            Outcome::IdleTimeout if state.has_output() => {
                tracing::debug!("no terminal event before idle timeout, finishing run");
                state.finish_with_result()
            }
            Outcome::IdleTimeout => state.finish_with_error(Failure::new(
                FailureKind::Timeout,
                format!(
                    "no response from OpenCode within {}s",
                    idle_timeout.as_secs_f64()
                ),
            )),
        };
        if let Some(event) = terminal {
            sink.emit(event).await;
        }
        sink.complete(state.summary());
    }

    /// Answer a question through the callback, or reject it so the agent is
    /// not left blocked.
    async fn resolve_question(&self, question: Question, cancel: &mut CancelToken) {
        let request_id = question.request_id.clone();
        let answers = match &self.question_callback {
            None => {
                tracing::warn!(%request_id, "no question handler configured");
                None
            }
            Some(callback) => {
                let question_timeout = self.client.settings().question_timeout;
                tokio::select! {
                    () = cancel.cancelled() => None,
                    answered = tokio::time::timeout(question_timeout, callback(question)) => match answered {
                        Ok(Ok(answers)) => Some(answers),
                        Ok(Err(e)) => {
                            tracing::warn!(%request_id, error = %e, "question handler failed");
                            None
                        }
                        Err(_) => {
                            tracing::warn!(%request_id, "question handler timed out");
                            None
                        }
                    },
                }
            }
        };

        if let Some(answers) = answers {
            match self.client.answer_question(&request_id, &answers).await {
                Ok(()) => {
                    tracing::info!(%request_id, "answered question");
                    return;
                }
                Err(e) => tracing::error!(%request_id, error = %e, "failed to answer question"),
            }
        }
        match self.client.reject_question(&request_id).await {
            Ok(()) => tracing::warn!(%request_id, "question rejected"),
            Err(e) => tracing::error!(%request_id, error = %e, "failed to reject question"),
        }
    }
}

async fn poll_queue(rx: &mut mpsc::Receiver<Value>, open: bool) -> Polled {
    if !open {
        tokio::time::sleep(POLL_INTERVAL).await;
        return Polled::Idle;
    }
    match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
        Ok(Some(payload)) => Polled::Payload(payload),
        Ok(None) => Polled::Closed,
        Err(_) => Polled::Idle,
    }
}

/// Await a finished task, returning its failure if it had one.
async fn task_failure<T>(task: &mut JoinHandle<Result<T, RunnerError>>) -> Option<Failure> {
    match task.await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_failure()),
        Err(e) => Some(Failure::transport(format!("background task failed: {e}"))),
    }
}
