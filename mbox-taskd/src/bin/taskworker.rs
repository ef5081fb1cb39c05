//! Diagnostic task worker.
//!
//! `mbox-taskworker <id> <kind> [arg]`
//!
//! - `identity`: succeeds with `arg` as the result
//! - `error`: records `arg` as the error and exits 50
//! - `crash`: panics without recording anything
//! - `sleep`: sleeps `arg` milliseconds, then succeeds without a result

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mbox_taskd::worker::WorkerContext;

const DEFAULT_SLEEP_MS: u64 = 60_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let ctx = WorkerContext::from_env()
        .await
        .context("Failed to set up worker context")?;
    ctx.exit_on_sigterm()
        .context("Failed to set up SIGTERM handler")?;

    let kind = ctx.args.first().cloned().unwrap_or_default();
    let arg = ctx.args.get(1).cloned();
    info!(id = %ctx.id, kind = %kind, arg = ?arg, "Worker started");

    let outcome = match kind.as_str() {
        "identity" => {
            ctx.report(50, "Working").await?;
            Ok(arg)
        }
        "error" => Err(arg.unwrap_or_else(|| "Task failed".to_string())),
        "crash" => panic!("crash requested for {}", ctx.id),
        "sleep" => {
            let ms = arg
                .as_deref()
                .map(str::parse::<u64>)
                .transpose()
                .context("sleep takes milliseconds")?
                .unwrap_or(DEFAULT_SLEEP_MS);
            ctx.report(10, "Sleeping").await?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(None)
        }
        other => {
            warn!(kind = %other, "Unknown worker kind");
            Err(format!("unknown worker kind '{}'", other))
        }
    };

    let code = ctx.finish(outcome).await;
    info!(id = %ctx.id, code = code, "Worker finished");
    std::process::exit(code);
}
