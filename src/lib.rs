use event::{Failure, FailureKind};

pub mod commands;
pub mod config;
pub mod display;
pub mod event;
pub mod logging;
pub mod normalize;
pub mod protocol;
pub mod ralph;
pub mod runner;
pub mod session;
pub mod transport;

/// Errors raised while constructing or driving a runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("OpenCode HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("event stream failed: {0}")]
    Sse(String),
    #[error("OpenCode session creation failed")]
    SessionCreate,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunnerError::Spawn { .. } => FailureKind::Spawn,
            RunnerError::UnknownEngine(_) | RunnerError::Config(_) => FailureKind::Config,
            RunnerError::Json(_) => FailureKind::Protocol,
            RunnerError::Http { .. }
            | RunnerError::Request(_)
            | RunnerError::Sse(_)
            | RunnerError::SessionCreate
            | RunnerError::Io(_) => FailureKind::Transport,
        }
    }

    /// The terminal failure reported to the consumer of a run.
    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
