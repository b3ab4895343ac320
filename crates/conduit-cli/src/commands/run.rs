use std::io::{self, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use conduit::config::Settings;
use conduit::{AgentRuntime, RunResult};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs one prompt and prints the result. Returns whether the run succeeded.
pub async fn handle_run(
    settings: &Settings,
    user: &str,
    dir: &Path,
    prompt: Option<String>,
    json: bool,
) -> Result<bool> {
    let directory = std::fs::canonicalize(dir)
        .with_context(|| format!("working directory {} is not accessible", dir.display()))?;
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => {
            let mut stdin = String::new();
            io::stdin()
                .read_to_string(&mut stdin)
                .context("failed to read the prompt from stdin")?;
            stdin
        }
    };
    if prompt.trim().is_empty() {
        bail!("no prompt given; pass --prompt or pipe one on stdin");
    }

    let runtime = AgentRuntime::from_settings(settings)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = runtime.execute(user, &directory, &prompt, cancel).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.is_success())
}

fn print_result(result: &RunResult) {
    if !result.text.is_empty() {
        println!("{}", result.text);
    }

    let rejected: Vec<_> = result
        .rejected_tools()
        .map(|entry| entry.event.name().to_string())
        .collect();
    if !rejected.is_empty() {
        eprintln!("{} {}", style("rejected tools:").yellow(), rejected.join(", "));
    }
    for note in &result.notes {
        eprintln!("{} {}", style("note:").dim(), note);
    }

    let status = if result.is_success() {
        style(result.termination.to_string()).green()
    } else {
        style(result.termination.to_string()).red()
    };
    eprintln!(
        "{} via {} backend, {} turns, ${:.4}",
        status,
        result.backend,
        result.turns,
        result.usage.cost()
    );
}
