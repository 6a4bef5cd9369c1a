#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay::event::{Event, Failure, FailureKind, RunSummary};
use relay::ralph::{
    LoopOutput, LoopSnapshot, LoopStatus, LoopStore, MemoryLoopStore, OutputSink, RalphConfig,
    RalphLoop, SessionClaim, StopReason,
};
use relay::runner::{CancelSlot, Engine, RunStream, Runner};
use tokio::sync::mpsc;

/// What the fake agent does on one invocation.
enum Turn {
    Finish { text: &'static str, cost: f64 },
    Fail { kind: FailureKind, cost: f64 },
    /// Emit some text, then hang until cancelled.
    Block { text: &'static str, cost: f64 },
}

struct ScriptedRunner {
    turns: Mutex<VecDeque<Turn>>,
    prompts: Mutex<Vec<String>>,
    cancel: CancelSlot,
}

impl ScriptedRunner {
    fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            prompts: Mutex::default(),
            cancel: CancelSlot::default(),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Runner for ScriptedRunner {
    fn engine(&self) -> Engine {
        Engine::Claude
    }

    fn run(&self, prompt: &str, continuation_id: Option<&str>) -> RunStream {
        assert!(continuation_id.is_none(), "loop iterations start fresh sessions");
        self.prompts.lock().unwrap().push(prompt.to_string());
        let turn = self.turns.lock().unwrap().pop_front().unwrap_or(Turn::Finish {
            text: "",
            cost: 0.0,
        });
        let mut token = self.cancel.begin();
        let (sink, stream) = RunStream::channel();
        tokio::spawn(async move {
            let summary = match turn {
                Turn::Finish { text, cost } => {
                    let summary = RunSummary {
                        text: text.to_string(),
                        cost,
                        ..Default::default()
                    };
                    sink.emit(Event::Text(text.to_string())).await;
                    sink.emit(Event::Result(Box::new(summary.clone()))).await;
                    summary
                }
                Turn::Fail { kind, cost } => {
                    sink.emit(Event::Error(Failure::new(kind, "agent fell over")))
                        .await;
                    RunSummary {
                        cost,
                        ..Default::default()
                    }
                }
                Turn::Block { text, cost } => {
                    sink.emit(Event::Text(text.to_string())).await;
                    token.cancelled().await;
                    sink.emit(Event::Error(Failure::cancelled())).await;
                    RunSummary {
                        text: text.to_string(),
                        cost,
                        ..Default::default()
                    }
                }
            };
            sink.complete(summary);
        });
        stream
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct ChannelSink(mpsc::UnboundedSender<LoopOutput>);

impl OutputSink for ChannelSink {
    fn deliver(&mut self, output: LoopOutput) {
        let _ = self.0.send(output);
    }
}

struct BrokenStore;

impl LoopStore for BrokenStore {
    fn save(&self, _snapshot: &LoopSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    fn latest(&self, _session: &str) -> anyhow::Result<Option<LoopSnapshot>> {
        anyhow::bail!("disk full")
    }

    fn history(&self, _session: &str) -> anyhow::Result<Vec<LoopSnapshot>> {
        anyhow::bail!("disk full")
    }

    fn claim(&self, _session: &str) -> anyhow::Result<Option<SessionClaim>> {
        anyhow::bail!("disk full")
    }
}

fn config(max_iterations: u32, completion_phrase: Option<&str>) -> RalphConfig {
    RalphConfig {
        session: "work".into(),
        prompt: "Fix the failing tests".into(),
        max_iterations,
        completion_phrase: completion_phrase.map(str::to_string),
        continuation_template: None,
    }
}

#[tokio::test]
async fn budget_runs_exactly_max_iterations() {
    let runner = ScriptedRunner::new(vec![
        Turn::Finish { text: "fixed one", cost: 0.1 },
        Turn::Finish { text: "fixed two", cost: 0.1 },
        Turn::Finish { text: "fixed three", cost: 0.1 },
        Turn::Finish { text: "never", cost: 9.0 },
    ]);
    let store = Arc::new(MemoryLoopStore::new());
    let ralph = RalphLoop::new(config(3, None), runner.clone(), store.clone()).unwrap();
    let mut outputs: Vec<LoopOutput> = Vec::new();
    let snapshot = ralph.run(&mut outputs).await;

    assert_eq!(snapshot.status, LoopStatus::Completed);
    assert_eq!(snapshot.stop_reason, Some(StopReason::BudgetExhausted));
    assert_eq!(snapshot.current_iteration, 3);
    assert!((snapshot.total_cost - 0.3).abs() < 1e-9);

    let prompts = runner.prompts();
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[0], "Fix the failing tests");
    assert!(prompts[1].contains("iteration 2"));
    assert!(prompts[1].contains("fixed one"));
    assert!(prompts[2].contains("fixed two"));

    let history = store.history("work").unwrap();
    let iterations: Vec<u32> = history.iter().map(|s| s.current_iteration).collect();
    assert_eq!(iterations, [0, 1, 2, 3, 3]);
    assert_eq!(store.latest("work").unwrap().unwrap(), snapshot);

    assert_eq!(
        outputs[0],
        LoopOutput::IterationStarted {
            iteration: 1,
            max_iterations: 3
        }
    );
    assert_eq!(outputs.last(), Some(&LoopOutput::Finished(snapshot)));
}

#[tokio::test]
async fn completion_phrase_stops_the_loop_early() {
    let runner = ScriptedRunner::new(vec![
        Turn::Finish { text: "all done?", cost: 0.05 },
        Turn::Finish { text: "Tests pass. ALL DONE", cost: 0.05 },
        Turn::Finish { text: "extra", cost: 0.05 },
    ]);
    let ralph = RalphLoop::new(
        config(10, Some("ALL DONE")),
        runner.clone(),
        Arc::new(MemoryLoopStore::new()),
    )
    .unwrap();
    let snapshot = ralph.run(&mut Vec::<LoopOutput>::new()).await;

    assert_eq!(snapshot.status, LoopStatus::Completed);
    assert_eq!(snapshot.stop_reason, Some(StopReason::CompletionPhrase));
    assert_eq!(snapshot.current_iteration, 2);
    let prompts = runner.prompts();
    assert!(prompts[0].starts_with("Fix the failing tests\n\n"));
    assert!(prompts[0].contains("ALL DONE"));
}

#[tokio::test]
async fn transient_errors_retry_within_budget() {
    let runner = ScriptedRunner::new(vec![
        Turn::Fail {
            kind: FailureKind::Remote,
            cost: 0.02,
        },
        Turn::Finish { text: "recovered", cost: 0.03 },
    ]);
    let ralph = RalphLoop::new(config(2, None), runner, Arc::new(MemoryLoopStore::new())).unwrap();
    let mut outputs: Vec<LoopOutput> = Vec::new();
    let snapshot = ralph.run(&mut outputs).await;

    assert_eq!(snapshot.status, LoopStatus::Completed);
    assert_eq!(snapshot.current_iteration, 2);
    assert_eq!(snapshot.failures, 1);
    assert_eq!(snapshot.last_error.as_deref(), Some("agent fell over"));
    assert!((snapshot.total_cost - 0.05).abs() < 1e-9);
    assert!(outputs.iter().any(|o| matches!(o, LoopOutput::Event(Event::Error(_)))));
}

#[tokio::test]
async fn fatal_error_fails_the_loop() {
    let runner = ScriptedRunner::new(vec![Turn::Fail {
        kind: FailureKind::Spawn,
        cost: 0.0,
    }]);
    let ralph = RalphLoop::new(config(0, None), runner.clone(), Arc::new(MemoryLoopStore::new()))
        .unwrap();
    let snapshot = ralph.run(&mut Vec::<LoopOutput>::new()).await;

    assert_eq!(snapshot.status, LoopStatus::Failed);
    assert_eq!(snapshot.stop_reason, Some(StopReason::FatalError));
    assert_eq!(snapshot.current_iteration, 1);
    assert_eq!(runner.prompts().len(), 1);
}

#[tokio::test]
async fn cancel_mid_iteration_keeps_its_accounting() {
    let runner = ScriptedRunner::new(vec![Turn::Block {
        text: "halfway",
        cost: 0.2,
    }]);
    let store = Arc::new(MemoryLoopStore::new());
    let ralph = RalphLoop::new(config(0, Some("DONE")), runner.clone(), store.clone()).unwrap();
    let handle = ralph.handle();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut sink = ChannelSink(tx);
        ralph.run(&mut sink).await
    });

    loop {
        let output = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if output == LoopOutput::Event(Event::Text("halfway".into())) {
            break;
        }
    }
    let live = handle.snapshot();
    assert_eq!(live.status, LoopStatus::Running);
    assert_eq!(live.current_iteration, 1);
    insta::assert_snapshot!(live.status_line(), @r"
    Ralph RUNNING
    Iteration: 1/unlimited
    Cost so far: $0.000
    Promise: DONE
    ");

    handle.cancel();
    assert_eq!(handle.status(), LoopStatus::Cancelling);
    handle.cancel();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.status, LoopStatus::Cancelled);
    assert_eq!(snapshot.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(snapshot.current_iteration, 1);
    assert_eq!(snapshot.failures, 0);
    assert!((snapshot.total_cost - 0.2).abs() < 1e-9);
    assert_eq!(runner.prompts().len(), 1);

    let mut rest = Vec::new();
    while let Ok(output) = rx.try_recv() {
        rest.push(output);
    }
    assert!(rest.iter().any(|o| matches!(
        o,
        LoopOutput::Event(Event::Error(f)) if f.kind == FailureKind::Cancelled
    )));
    assert!(matches!(
        rest.last(),
        Some(LoopOutput::Finished(s)) if s.status == LoopStatus::Cancelled
    ));

    // Terminal loops never move again.
    handle.cancel();
    assert_eq!(handle.status(), LoopStatus::Cancelled);
    assert_eq!(store.latest("work").unwrap().unwrap().status, LoopStatus::Cancelled);
}

#[tokio::test]
async fn cancel_before_first_iteration() {
    let runner = ScriptedRunner::new(Vec::new());
    let ralph = RalphLoop::new(config(5, None), runner.clone(), Arc::new(MemoryLoopStore::new()))
        .unwrap();
    ralph.handle().cancel();
    let snapshot = ralph.run(&mut Vec::<LoopOutput>::new()).await;
    assert_eq!(snapshot.status, LoopStatus::Cancelled);
    assert_eq!(snapshot.current_iteration, 0);
    assert!(runner.prompts().is_empty());
}

#[tokio::test]
async fn store_failures_do_not_stop_the_loop() {
    let runner = ScriptedRunner::new(vec![Turn::Finish { text: "ok", cost: 0.0 }]);
    let ralph = RalphLoop::new(config(1, None), runner, Arc::new(BrokenStore)).unwrap();
    let snapshot = ralph.run(&mut Vec::<LoopOutput>::new()).await;
    assert_eq!(snapshot.status, LoopStatus::Completed);
}

#[tokio::test]
async fn custom_continuation_template() {
    let runner = ScriptedRunner::new(vec![
        Turn::Finish { text: "step one", cost: 0.0 },
        Turn::Finish { text: "step two", cost: 0.0 },
    ]);
    let ralph = RalphLoop::new(
        RalphConfig {
            continuation_template: Some("Keep going ({{iteration}}): {{previous_output}}".into()),
            ..config(2, None)
        },
        runner.clone(),
        Arc::new(MemoryLoopStore::new()),
    )
    .unwrap();
    ralph.run(&mut Vec::<LoopOutput>::new()).await;
    assert_eq!(runner.prompts()[1], "Keep going (2): step one");
}
