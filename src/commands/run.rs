use std::io::Write;
use std::sync::Arc;

use anyhow::Result;

use crate::display::renderer::Renderer;
use crate::event::{Event, RunSummary};
use crate::runner::Runner;

pub struct RunConfig {
    pub prompt: String,
    /// Resume this agent session instead of starting a fresh one.
    pub continuation_id: Option<String>,
}

/// How a single run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub summary: Option<RunSummary>,
}

/// Run one prompt to completion, rendering events as they arrive. Ctrl-C
/// cancels the run.
pub async fn run<W: Write>(
    config: RunConfig,
    runner: Arc<dyn Runner>,
    renderer: &mut Renderer<W>,
) -> Result<RunOutcome> {
    let interrupt = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling run");
                runner.cancel();
            }
        })
    };

    let mut stream = runner.run(&config.prompt, config.continuation_id.as_deref());
    let mut success = true;
    while let Some(event) = stream.next().await {
        if matches!(event, Event::Error(_)) {
            success = false;
        }
        renderer.render_event(&event);
    }
    let summary = stream.finish().await;
    interrupt.abort();

    Ok(RunOutcome { success, summary })
}
