use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay::commands::AgentArgs;
use relay::config::Reasoning;

/// Agent options shared across commands.
#[derive(clap::Args, Debug, Default)]
pub struct AgentOpts {
    /// Engine to run: claude (cc), opencode (oc) or opencode-cli.
    #[arg(long, global = true)]
    pub engine: Option<String>,

    /// Model id, e.g. `sonnet` or `anthropic/claude-sonnet-4`.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Reasoning effort.
    #[arg(long, value_enum, global = true)]
    pub reasoning: Option<Reasoning>,

    /// Config file (defaults to ./relay.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl AgentOpts {
    pub fn into_args(self) -> AgentArgs {
        AgentArgs {
            engine: self.engine,
            model: self.model,
            reasoning: self.reasoning,
            config_path: self.config,
            working_dir: None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "relay",
    about = "Run coding agents with one normalized event stream, once or in a loop",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Prompt to send to the agent.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Continue an existing agent session.
    #[arg(long)]
    pub resume: Option<String>,

    #[command(flatten)]
    pub agent: AgentOpts,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Re-run the agent until it declares completion or the budget runs out.
    Ralph {
        /// Task for the agent.
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Maximum number of iterations (0 = unlimited).
        #[arg(long, default_value = "0")]
        max: u32,

        /// Phrase that signals the task is done.
        #[arg(long)]
        done: Option<String>,

        /// Session the loop is recorded under.
        #[arg(long, default_value = relay::commands::DEFAULT_SESSION)]
        session: String,
    },

    /// Show the latest loop status.
    Status {
        #[arg(long, default_value = relay::commands::DEFAULT_SESSION)]
        session: String,
    },
}
