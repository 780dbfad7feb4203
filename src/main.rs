// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agentrt::AgentRuntime;
use agentrt_config::AgentMode;
use agentrt_core::AgentEvent;

/// A single-user headless driver for the agent runtime.
///
/// Front ends (TUIs, gateways, CI runners) are expected to be separate
/// consumers of `agentrt_core`/`agentrt_model`/`agentrt_tools`; this binary
/// is the minimal reference driver: it loads configuration, builds a model
/// provider (or a failover router across `providers:`), registers the
/// built-in filesystem/shell tools, and streams one turn's events to stdout.
#[derive(Parser, Debug)]
#[command(name = "agentrt", version, about = "Agent runtime core — headless driver")]
struct Cli {
    /// The user message to submit. When omitted, read from stdin.
    prompt: Option<String>,

    /// Path to an explicit YAML config file (overrides the search path).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the model to use, as `<provider_key>` or `<provider_key>/<model>`.
    #[arg(long)]
    model: Option<String>,

    /// Agent mode: research | plan | agent.
    #[arg(long)]
    mode: Option<String>,

    /// Print the merged configuration as YAML and exit.
    #[arg(long)]
    show_config: bool,

    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = agentrt_config::load(cli.config.as_deref())?;

    if cli.show_config {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let prompt = match cli.prompt {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given (pass it as an argument or pipe it on stdin)");
    }

    let mode = match cli.mode.as_deref() {
        Some("research") => AgentMode::Research,
        Some("plan") => AgentMode::Plan,
        Some("agent") => AgentMode::Agent,
        Some(other) => anyhow::bail!("unknown mode '{other}' (expected research|plan|agent)"),
        None => config.agent.default_mode,
    };

    let mut runtime = AgentRuntime::from_config(&config, mode, cli.model.as_deref())?;

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(128);
    let drain = tokio::spawn(async move { print_events(&mut rx).await });

    runtime.submit(&prompt, tx).await?;
    drain.await.context("event printer task panicked")?;

    Ok(())
}

async fn print_events(rx: &mut mpsc::Receiver<AgentEvent>) {
    let tool_rounds = AtomicUsize::new(0);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta(chunk) => {
                let _ = write!(out, "{chunk}");
                let _ = out.flush();
            }
            AgentEvent::TextComplete(_) => {
                let _ = writeln!(out);
            }
            AgentEvent::ThinkingDelta(_) | AgentEvent::ThinkingComplete(_) => {}
            AgentEvent::ToolCallStarted(call) => {
                tool_rounds.fetch_add(1, Ordering::Relaxed);
                eprintln!("[tool] {} {}", call.name, call.args);
            }
            AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                eprintln!("[tool] {tool_name} {}", if is_error { "failed" } else { "ok" });
            }
            AgentEvent::ContextCompacted { tokens_before, tokens_after, .. } => {
                eprintln!("[compact] {tokens_before} -> {tokens_after} tokens");
            }
            AgentEvent::ContextWarning { estimated, max, ratio } => {
                eprintln!("[context] {estimated}/{max} tokens ({:.0}%) — approaching context limit", ratio * 100.0);
            }
            AgentEvent::TokenUsage { input, output, .. } => {
                eprintln!("[tokens] in={input} out={output}");
            }
            AgentEvent::TurnComplete => break,
            AgentEvent::Error(msg) => {
                eprintln!("[error] {msg}");
                break;
            }
            AgentEvent::Aborted { .. } => {
                eprintln!("[aborted]");
                break;
            }
            AgentEvent::TodoUpdate(_) | AgentEvent::ModeChanged(_) => {}
            AgentEvent::Question { questions, .. } => {
                for q in questions {
                    eprintln!("[question] {q}");
                }
            }
            AgentEvent::QuestionAnswer { .. } => {}
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
