mod cli;

use std::io::{IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay::commands::{self, AgentArgs};
use relay::display::renderer::Renderer;
use relay::ralph::{FileLoopStore, LoopStatus, RalphConfig};
use relay::runner::create_runner;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    relay::logging::init();
    let cli = Cli::parse();
    let args = cli.agent.into_args();

    match cli.command {
        Some(Command::Status { session }) => {
            let store = FileLoopStore::new(commands::loop_dir(&std::env::current_dir()?));
            commands::status::status(&store, &session, &mut std::io::stdout())?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Ralph {
            prompt,
            max,
            done,
            session,
        }) => ralph(&args, prompt, max, done, session).await,
        None => {
            let prompt = match cli.prompt {
                Some(prompt) => prompt,
                None => read_stdin_prompt()?,
            };
            single_run(&args, prompt, cli.resume).await
        }
    }
}

async fn single_run(args: &AgentArgs, prompt: String, resume: Option<String>) -> Result<ExitCode> {
    let config = args.load_config()?;
    let mut options = args.engine_options(&config);
    if std::io::stdin().is_terminal() {
        options.question_callback = Some(commands::stdin_question_callback());
    }
    let runner = create_runner(args.engine(&config), options)?;
    let mut renderer = Renderer::new();
    let outcome = commands::run::run(
        commands::run::RunConfig {
            prompt,
            continuation_id: resume,
        },
        runner,
        &mut renderer,
    )
    .await?;
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn ralph(
    args: &AgentArgs,
    prompt: String,
    max_iterations: u32,
    completion_phrase: Option<String>,
    session: String,
) -> Result<ExitCode> {
    let config = args.load_config()?;
    let mut options = args.engine_options(&config);
    options.session_name = Some(session.clone());
    let runner = create_runner(args.engine(&config), options)?;
    let store = Arc::new(FileLoopStore::new(commands::loop_dir(
        &std::env::current_dir()?,
    )));
    let mut renderer = Renderer::new();
    let snapshot = commands::ralph::ralph(
        RalphConfig {
            session,
            prompt,
            max_iterations,
            completion_phrase,
            continuation_template: config.ralph.continuation_template.clone(),
        },
        runner,
        store,
        &mut renderer,
    )
    .await?;
    Ok(if snapshot.status == LoopStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn read_stdin_prompt() -> Result<String> {
    if std::io::stdin().is_terminal() {
        anyhow::bail!("no prompt given; pass one as an argument or pipe it on stdin");
    }
    let mut prompt = String::new();
    std::io::stdin()
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        anyhow::bail!("empty prompt");
    }
    Ok(prompt)
}
