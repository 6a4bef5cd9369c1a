use std::io::Write;

use anyhow::Result;

use crate::ralph::LoopStore;

/// Print the most recent loop status for `session`.
pub fn status(store: &dyn LoopStore, session: &str, out: &mut impl Write) -> Result<()> {
    match store.latest(session)? {
        Some(snapshot) => {
            writeln!(out, "{}", snapshot.status_line())?;
            if let Some(error) = &snapshot.last_error {
                writeln!(out, "Last error: {error}")?;
            }
        }
        None => writeln!(out, "No Ralph loops in this session.")?,
    }
    Ok(())
}
