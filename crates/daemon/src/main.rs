use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use stack_backup_compose::{ComposeController, DirectoryCatalog, StackController};
use stack_backup_core::{RunOutcome, RunSummary};
use stack_backup_daemon::config::{self, Config, Settings};
use stack_backup_daemon::{build_router, AppState, Engine, LogSink, RestoreRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

enum Mode {
    Serve,
    Backup(Vec<String>),
    Restore {
        archive: String,
        stack: String,
        allow_cross_stack: bool,
    },
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (cfg, mode) = parse_args()?;
    let settings = Settings::resolve(&cfg);
    settings.ensure_dirs()?;

    let controller: Arc<dyn StackController> =
        Arc::new(ComposeController::new(settings.compose_config()));
    let catalog = Arc::new(DirectoryCatalog::new(
        &settings.stacks_dir,
        settings.skip_stop.iter().cloned(),
        Arc::clone(&controller),
    ));
    let engine = Engine::new(
        settings.engine_settings(),
        controller,
        catalog,
        LogSink::new(&settings.log_dir),
    );

    match mode {
        Mode::Serve => run_service(engine, settings).await,
        Mode::Backup(stacks) => {
            let handle = engine.trigger_backup(&stacks).await?;
            finish_run(handle.wait().await?)
        }
        Mode::Restore {
            archive,
            stack,
            allow_cross_stack,
        } => {
            let mut request = RestoreRequest::new(archive, stack);
            request.allow_cross_stack = allow_cross_stack;
            let handle = engine.trigger_restore(request).await?;
            finish_run(handle.wait().await?)
        }
        Mode::Sweep => {
            let removed = engine.trigger_sweep().await?;
            info!(removed, "retention sweep finished");
            Ok(())
        }
    }
}

/// Parse CLI args, returning the loaded config and the selected mode.
fn parse_args() -> Result<(Config, Mode)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut allow_cross_stack = false;
    let mut positional: Vec<String> = Vec::new();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            "--allow-cross-stack" => allow_cross_stack = true,
            other => positional.push(other.to_owned()),
        }
        i += 1;
    }

    let mode = match positional.split_first() {
        None => Mode::Serve,
        Some((cmd, rest)) => match (cmd.as_str(), rest) {
            ("serve", []) => Mode::Serve,
            ("sweep", []) => Mode::Sweep,
            ("backup", []) => bail!("backup requires at least one stack name"),
            ("backup", stacks) => Mode::Backup(stacks.to_vec()),
            ("restore", [archive, stack]) => Mode::Restore {
                archive: archive.clone(),
                stack: stack.clone(),
                allow_cross_stack,
            },
            ("restore", _) => bail!("usage: restore <archive> <stack> [--allow-cross-stack]"),
            (other, _) => bail!("unknown mode: {other}"),
        },
    };

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

fn finish_run(run: RunSummary) -> Result<()> {
    let outcome = run.outcome.unwrap_or(RunOutcome::Failed);
    info!(
        run_id = %run.id,
        %outcome,
        succeeded = run.succeeded_count(),
        failed = run.failed_count(),
        log_file = run.log_file.as_deref().unwrap_or("-"),
        "{} run finished",
        run.kind.as_str()
    );
    if outcome != RunOutcome::Success {
        bail!("{} run {} ended with outcome {outcome}", run.kind.as_str(), run.id);
    }
    Ok(())
}

async fn run_service(engine: Engine, settings: Settings) -> Result<()> {
    let addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", settings.listen))?;
    let state = AppState {
        engine: engine.clone(),
        api_token: settings.api_token.clone(),
        settings: Arc::new(settings),
    };
    let app = build_router(state);

    info!(%addr, "starting stack backup API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // a run dropped here would leave its stack stopped
    if engine.status().busy {
        info!("waiting for run in progress");
        tokio::select! {
            _ = engine.wait_idle() => info!("run finished; exiting"),
            _ = tokio::signal::ctrl_c() => {
                warn!("second shutdown request; exiting with a run in progress")
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
