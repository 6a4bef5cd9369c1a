//! Loop-status persistence, keyed by logical session name.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use fs2::FileExt;

use super::LoopSnapshot;

/// Records loop snapshots so status queries from other tasks or processes
/// see live progress.
pub trait LoopStore: Send + Sync {
    fn save(&self, snapshot: &LoopSnapshot) -> Result<()>;

    /// Most recent snapshot for `session`.
    fn latest(&self, session: &str) -> Result<Option<LoopSnapshot>>;

    /// Every snapshot saved for `session`, oldest first.
    fn history(&self, session: &str) -> Result<Vec<LoopSnapshot>>;

    /// Claim `session` for one loop. `None` when another loop holds it.
    fn claim(&self, session: &str) -> Result<Option<SessionClaim>>;
}

/// Exclusive right to run a loop in one session. Released when dropped.
#[derive(Debug)]
pub struct SessionClaim {
    _claim: Claim,
}

#[derive(Debug)]
enum Claim {
    /// The lock is released when the file is closed.
    File { _file: File },
    Memory {
        active: Arc<Mutex<HashSet<String>>>,
        session: String,
    },
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Claim::Memory { active, session } = self {
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(session.as_str());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryLoopStore {
    sessions: Mutex<HashMap<String, Vec<LoopSnapshot>>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLoopStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoopStore for MemoryLoopStore {
    fn save(&self, snapshot: &LoopSnapshot) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(snapshot.session.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    fn latest(&self, session: &str) -> Result<Option<LoopSnapshot>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .and_then(|h| h.last().cloned()))
    }

    fn history(&self, session: &str) -> Result<Vec<LoopSnapshot>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    fn claim(&self, session: &str) -> Result<Option<SessionClaim>> {
        let claimed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.to_string());
        Ok(claimed.then(|| {
            SessionClaim {
                _claim: Claim::Memory {
                    active: Arc::clone(&self.active),
                    session: session.to_string(),
                },
            }
        }))
    }
}

/// One JSON-lines file per session under a directory. Writers take an
/// exclusive lock, readers a shared one.
#[derive(Debug, Clone)]
pub struct FileLoopStore {
    dir: PathBuf,
}

impl FileLoopStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem(session)))
    }

    fn lock_path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(session)))
    }

    fn read(&self, session: &str) -> Result<Vec<LoopSnapshot>> {
        let path = self.path(session);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::anyhow!(e).context(format!("failed to open {}", path.display())));
            }
        };
        file.lock_shared()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        let mut snapshots = Vec::new();
        for line in BufReader::new(&file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping corrupt loop status line"),
            }
        }
        file.unlock()
            .with_context(|| format!("failed to unlock {}", path.display()))?;
        Ok(snapshots)
    }
}

/// File name for a session: unsafe characters become `_` and the name never
/// starts with a dot.
fn file_stem(session: &str) -> String {
    let name: String = session
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        format!("_{name}")
    } else {
        name
    }
}

impl LoopStore for FileLoopStore {
    fn save(&self, snapshot: &LoopSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path(&snapshot.session);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        let mut line = serde_json::to_string(snapshot).context("failed to serialize loop status")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.unlock()
            .with_context(|| format!("failed to unlock {}", path.display()))?;
        Ok(())
    }

    fn latest(&self, session: &str) -> Result<Option<LoopSnapshot>> {
        Ok(self.read(session)?.pop())
    }

    fn history(&self, session: &str) -> Result<Vec<LoopSnapshot>> {
        self.read(session)
    }

    fn claim(&self, session: &str) -> Result<Option<SessionClaim>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.lock_path(session);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(SessionClaim {
                _claim: Claim::File { _file: file },
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(anyhow::anyhow!(e).context(format!("failed to lock {}", path.display()))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ralph::LoopStatus;

    fn snapshot(session: &str, iteration: u32) -> LoopSnapshot {
        let mut snapshot = LoopSnapshot::new(session, "do it", 5, None);
        snapshot.current_iteration = iteration;
        snapshot
    }

    #[test]
    fn memory_store_keeps_history_per_session() {
        let store = MemoryLoopStore::new();
        store.save(&snapshot("a", 1)).unwrap();
        store.save(&snapshot("a", 2)).unwrap();
        store.save(&snapshot("b", 7)).unwrap();
        assert_eq!(store.latest("a").unwrap().unwrap().current_iteration, 2);
        assert_eq!(store.history("a").unwrap().len(), 2);
        assert!(store.latest("missing").unwrap().is_none());
    }

    #[test]
    fn file_store_round_trips_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLoopStore::new(dir.path().join("loops"));
        assert!(store.latest("work").unwrap().is_none());

        store.save(&snapshot("work", 1)).unwrap();
        let mut done = snapshot("work", 2);
        done.status = LoopStatus::Completed;
        store.save(&done).unwrap();

        let latest = store.latest("work").unwrap().unwrap();
        assert_eq!(latest.current_iteration, 2);
        assert_eq!(latest.status, LoopStatus::Completed);
        assert_eq!(store.history("work").unwrap().len(), 2);
    }

    #[test]
    fn file_store_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLoopStore::new(dir.path());
        store.save(&snapshot("s", 1)).unwrap();
        let path = dir.path().join("s.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        assert_eq!(store.history("s").unwrap().len(), 1);
    }

    #[test]
    fn memory_claim_is_exclusive_until_dropped() {
        let store = MemoryLoopStore::new();
        let claim = store.claim("work").unwrap().unwrap();
        assert!(store.claim("work").unwrap().is_none());
        assert!(store.claim("other").unwrap().is_some());
        drop(claim);
        assert!(store.claim("work").unwrap().is_some());
    }

    #[test]
    fn file_claim_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLoopStore::new(dir.path().join("loops"));
        let second = FileLoopStore::new(dir.path().join("loops"));
        let claim = first.claim("work").unwrap().unwrap();
        assert!(second.claim("work").unwrap().is_none());
        assert!(second.claim("other").unwrap().is_some());
        drop(claim);
        assert!(second.claim("work").unwrap().is_some());
    }

    #[test]
    fn session_names_are_sanitized() {
        let store = FileLoopStore::new("/tmp/x");
        assert_eq!(store.path("../etc/passwd"), PathBuf::from("/tmp/x/_.._etc_passwd.jsonl"));
        assert_eq!(store.path("my session"), PathBuf::from("/tmp/x/my_session.jsonl"));
        assert_eq!(store.lock_path(".hidden"), PathBuf::from("/tmp/x/_.hidden.lock"));
    }
}
