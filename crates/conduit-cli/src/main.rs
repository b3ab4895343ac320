use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conduit::config::{ConfigManager, Settings};

mod commands;
mod logging;

use commands::run::handle_run;
use commands::session::{handle_session_list, handle_session_show, handle_session_sweep};
use logging::setup_logging;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.yaml (defaults to the conduit config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one prompt in a working directory
    #[command(about = "Execute one prompt in a working directory")]
    Run {
        #[arg(short, long, help = "User the session belongs to")]
        user: String,

        #[arg(
            short,
            long,
            value_name = "DIR",
            help = "Working directory of the run",
            default_value = "."
        )]
        dir: PathBuf,

        #[arg(
            short,
            long,
            help = "Prompt text",
            long_help = "Prompt to execute. Read from stdin when omitted."
        )]
        prompt: Option<String>,

        #[arg(long, help = "Print the full run result as JSON")]
        json: bool,
    },

    /// Inspect and maintain stored sessions
    #[command(about = "Inspect and maintain stored sessions", alias = "s")]
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    #[command(about = "Show the session of a user and directory")]
    Show {
        #[arg(short, long)]
        user: String,

        #[arg(short, long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    #[command(about = "List all stored sessions")]
    List {
        #[arg(long, help = "Output as JSON")]
        json: bool,
    },

    #[command(about = "Delete sessions idle longer than the configured timeout")]
    Sweep,
}

fn load_settings(config: Option<PathBuf>) -> Result<Settings> {
    let manager = match config {
        Some(path) => ConfigManager::new(path),
        None => ConfigManager::from_default_location()?,
    };
    Ok(Settings::load(&manager)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.verbose)?;
    let settings = load_settings(cli.config)?;

    match cli.command {
        Command::Run {
            user,
            dir,
            prompt,
            json,
        } => {
            let succeeded = handle_run(&settings, &user, &dir, prompt, json).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Command::Session { command } => match command {
            SessionCommand::Show { user, dir } => handle_session_show(&settings, &user, &dir).await?,
            SessionCommand::List { json } => handle_session_list(&settings, json).await?,
            SessionCommand::Sweep => handle_session_sweep(&settings).await?,
        },
    }
    Ok(())
}
