// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

mod config;
mod conversation;
mod error;
mod logging;
mod provider;
mod reflow;
mod sse;
mod store;
mod stream;
mod tui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::builder::styling::{AnsiColor, Effects, Styles};

use config::Config;
use conversation::{Orchestrator, OrchestratorSettings};
use error::{Error, Result};
use provider::ConfigClientFactory;
use store::{ConversationId, ConversationStore, JsonlStore};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "ask-ai")]
#[command(about = "Ask AI models questions from the terminal")]
#[command(version)]
#[command(styles = STYLES)]
struct Args {
    #[arg(short, long, help = "Model to use, by name or alias from the config")]
    model: Option<String>,

    #[arg(short, long, help = "Role from the config supplying the system prompt")]
    role: Option<String>,

    #[arg(long, value_name = "TEXT", help = "System prompt sent with every request")]
    system_prompt: Option<String>,

    #[arg(short, long, help = "Sampling temperature for every request")]
    temperature: Option<f32>,

    #[arg(short = 'M', long, value_name = "N", help = "Maximum tokens per response")]
    max_tokens: Option<u32>,

    #[arg(long, help = "Do not write conversations to the history file")]
    no_record: bool,

    #[arg(short = 'C', long, value_name = "PATH", help = "Config file to use")]
    config: Option<PathBuf>,

    #[arg(
        short = 'c',
        long = "continue",
        conflicts_with = "id",
        help = "Continue the most recent conversation"
    )]
    continue_conversation: bool,

    #[arg(short, long, value_name = "N", help = "Continue conversation N")]
    id: Option<ConversationId>,

    #[arg(long, value_name = "N", help = "Number of prior messages sent as context")]
    context_length: Option<usize>,

    #[arg(short, long, help = "Print the effective configuration and exit")]
    dump_config: bool,

    #[arg(
        short = 'k',
        long,
        requires = "dump_config",
        help = "Show API keys in the dumped configuration"
    )]
    show_keys: bool,
}

/// Load the config file and apply the command line on top. A role is
/// applied first so `-m` and `--system-prompt` can still override it.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_role(args.role.as_deref())?;
    if let Some(model) = &args.model {
        config.default_model = model.clone();
    }
    if let Some(prompt) = &args.system_prompt {
        config.system_prompt = Some(prompt.clone());
    }
    if let Some(context_length) = args.context_length {
        config.context_length = context_length;
    }
    if args.temperature.is_some() {
        config.temperature = args.temperature;
    }
    if args.max_tokens.is_some() {
        config.max_tokens = args.max_tokens;
    }
    if let Some(name) = config.resolve_model_name(&config.default_model) {
        config.default_model = name;
    }
    config.validate()?;
    Ok(config)
}

/// Pick the conversation to resume, if any.
fn resume_target(args: &Args, store: &impl ConversationStore) -> Result<Option<ConversationId>> {
    if let Some(id) = args.id {
        if store.conversation(id).is_none() {
            return Err(Error::Store(format!("conversation {id} does not exist")));
        }
        return Ok(Some(id));
    }
    if args.continue_conversation {
        let last = store.last_conversation_id();
        if last.is_none() {
            tracing::info!("No previous conversation to continue");
        }
        return Ok(last);
    }
    Ok(None)
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;

    if args.dump_config {
        print!("{}", config.dump(args.show_keys)?);
        return Ok(());
    }

    let log_path = config.log_path();
    if !logging::init(&log_path, config.log.level.as_deref()) {
        eprintln!("warning: could not open log file {}", log_path.display());
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), model = %config.default_model, "Starting");

    // Before the terminal goes raw, so a command can prompt.
    config.resolve_key_commands();

    let store = if args.no_record {
        JsonlStore::open_read_only(&config.history_path())?
    } else {
        JsonlStore::open(&config.history_path())?
    };
    tracing::info!(
        path = %store.path().display(),
        record = !args.no_record,
        "Using history file"
    );
    let resume = resume_target(&args, &store)?;

    let mut settings = OrchestratorSettings::from_config(&config);
    settings.summarize &= !args.no_record;

    let config = Arc::new(config);
    let orchestrator = Orchestrator::new(
        store,
        ConfigClientFactory::new(config.clone()),
        settings,
        config.default_model.clone(),
    );

    tui::run(orchestrator, resume).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("ask-ai: {e}");
            ExitCode::FAILURE
        }
    }
}
