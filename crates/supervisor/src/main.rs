// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! sfd: the Sprint Foreman supervisor binary.

use clap::Parser;
use serde_json::json;
use sf_core::{EventSink, StderrSink};
use sf_supervisor::config::{load_config, load_dotenv, merged_env, CliFlags};
use sf_supervisor::wiring::run_supervisor;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Sprint supervisor: dispatches agent runs against the board and keeps it
/// reconciled with the backend.
#[derive(Debug, Parser)]
#[command(name = "sfd", version, about)]
struct Args {
    /// Do not call backend write endpoints or execute worker intents
    #[arg(long)]
    dry_run: bool,

    /// Run the planner once and exit
    #[arg(long, conflicts_with = "loop_")]
    once: bool,

    /// Run the planner loop (default)
    #[arg(long = "loop")]
    loop_: bool,

    /// Sprint id (overrides ORCHESTRATOR_SPRINT)
    #[arg(long)]
    sprint: Option<String>,

    /// Ready-buffer size target for autopromotion
    #[arg(long)]
    ready_target: Option<u32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed arguments");
    let flags = CliFlags {
        dry_run: args.dry_run,
        once: args.once,
        sprint: args.sprint,
        ready_target: args.ready_target,
    };

    let env = merged_env(load_dotenv(Path::new(".env")));
    let config = match load_config(&env, &flags) {
        Ok(config) => config,
        Err(error) => {
            StderrSink.emit(json!({"type": "CONFIG_ERROR", "error": error.to_string()}));
            std::process::exit(2);
        }
    };

    let code = run_supervisor(config).await;
    std::process::exit(code);
}
