use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::ralph::{LoopSnapshot, LoopStatus, LoopStore, OutputSink, RalphConfig, RalphLoop};
use crate::runner::Runner;

/// Run a Ralph loop until it reaches a terminal status. Ctrl-C requests a
/// cooperative cancel that lands after the current iteration drains.
///
/// Fails without running anything when another loop holds the session.
pub async fn ralph(
    config: RalphConfig,
    runner: Arc<dyn Runner>,
    store: Arc<dyn LoopStore>,
    sink: &mut impl OutputSink,
) -> Result<LoopSnapshot> {
    let Some(_claim) = store
        .claim(&config.session)
        .with_context(|| format!("failed to claim session `{}`", config.session))?
    else {
        anyhow::bail!(
            "a Ralph loop is already running in session `{}`; cancel it first",
            config.session
        );
    };

    // Nobody holds the session, so a non-terminal record is left over from a
    // loop that died.
    if let Some(mut stale) = store.latest(&config.session)?
        && !stale.status.is_terminal()
    {
        tracing::warn!(
            session = %config.session,
            iteration = stale.current_iteration,
            "previous loop never reached a terminal status, marking it failed"
        );
        stale.status = LoopStatus::Failed;
        stale.last_error = Some("loop stopped without recording a final status".to_string());
        stale.updated_at = Utc::now();
        store.save(&stale)?;
    }

    let ralph = RalphLoop::new(config, runner, store)?;
    let handle = ralph.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let snapshot = ralph.run(sink).await;
    interrupt.abort();
    Ok(snapshot)
}
