use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};

use crate::event::{Event, RunSummary};

/// Capacity of the per-run event channel.
const EVENT_BUFFER: usize = 256;

/// Live, single-pass sequence of events from one run.
///
/// Events arrive in wire order and end with exactly one terminal event. Once
/// [`next`](Self::next) returns `None`, [`finish`](Self::finish) yields the
/// final statistics.
pub struct RunStream {
    events: mpsc::Receiver<Event>,
    summary: oneshot::Receiver<RunSummary>,
}

/// Producer side of a [`RunStream`], owned by a transport driver task.
pub struct RunSink {
    events: mpsc::Sender<Event>,
    summary: oneshot::Sender<RunSummary>,
}

impl RunStream {
    pub fn channel() -> (RunSink, RunStream) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (summary_tx, summary_rx) = oneshot::channel();
        (
            RunSink {
                events: event_tx,
                summary: summary_tx,
            },
            RunStream {
                events: event_rx,
                summary: summary_rx,
            },
        )
    }

    /// A stream that yields a single event and then ends.
    pub fn immediate(event: Event, summary: RunSummary) -> RunStream {
        let (sink, stream) = Self::channel();
        // Capacity is non-zero, so the first send always fits.
        let _ = sink.events.try_send(event);
        sink.complete(summary);
        stream
    }

    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Final statistics. Drains any events not yet consumed.
    pub async fn finish(mut self) -> Option<RunSummary> {
        while self.events.recv().await.is_some() {}
        self.summary.await.ok()
    }

    /// Consume the whole run.
    pub async fn collect(mut self) -> (Vec<Event>, Option<RunSummary>) {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        let summary = self.finish().await;
        (events, summary)
    }
}

impl RunSink {
    /// Deliver an event. Returns `false` once the consumer has gone away.
    pub async fn emit(&self, event: Event) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Publish the final statistics and close the stream.
    pub fn complete(self, summary: RunSummary) {
        let _ = self.summary.send(summary);
    }
}

/// Requests cancellation of one run.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Observes cancellation of one run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Holds the cancel handle of a runner's current run.
///
/// `cancel` is idempotent and a no-op before the first run.
#[derive(Debug, Default)]
pub struct CancelSlot(Mutex<Option<CancelHandle>>);

impl CancelSlot {
    /// Start tracking a new run, returning its token.
    pub fn begin(&self) -> CancelToken {
        let (handle, token) = cancel_pair();
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        token
    }

    pub fn cancel(&self) {
        if let Some(handle) = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.cancel();
        }
    }
}
