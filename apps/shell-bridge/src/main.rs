use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};
use url::Url;

use shell_bridge::cli::{Cli, Command, ConnectArgs, LoggingArgs, ServeArgs};
use shell_bridge::client;
use shell_bridge::config::Config;
use shell_bridge::host::{self, HostConfig};
use shell_bridge::scheduler::TokioScheduler;
use shell_bridge::session::{ConnectionState, SessionController, SessionHandle};
use shell_bridge::surface::Viewport;
use shell_bridge::telemetry;
use shell_bridge::transport::WebSocketConnector;

const CLIENT_LOG_FILE: &str = "shell-bridge.log";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Connect(args) => connect(args, &cli.logging).await,
        Command::Serve(args) => serve(args, &cli.logging).await,
    }
}

async fn connect(args: ConnectArgs, logging_args: &LoggingArgs) -> Result<()> {
    let mut log_config = logging_args.to_config();
    // stderr belongs to the rendered terminal.
    if log_config.file.is_none() {
        log_config.file = Some(std::env::temp_dir().join(CLIENT_LOG_FILE));
    }
    telemetry::init(&log_config).context("failed to initialise logging")?;

    let mut config = Config::from_env();
    if let Some(origin) = args.origin {
        config.origin = origin;
    }
    let endpoint = match args.url.as_deref() {
        Some(url) => Url::parse(url).with_context(|| format!("invalid --url {url:?}"))?,
        None => config.endpoint().context("cannot derive terminal endpoint")?,
    };

    let viewport = crossterm::terminal::size()
        .ok()
        .map(|(cols, rows)| client::body_size(cols, rows))
        .and_then(|(cols, rows)| Viewport::new(cols, rows).ok())
        .unwrap_or_default();
    info!(target = "main", %endpoint, %viewport, "starting session");

    let (handle, task) = SessionController::spawn(
        config.session_config(endpoint, viewport),
        Arc::new(WebSocketConnector),
        Arc::new(TokioScheduler),
    );

    if let Some(path) = args.inject {
        let injector = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = inject_from(&path, &injector, args.submit).await {
                warn!(target = "main", path = %path.display(), error = %err, "injection failed");
            }
        });
    }

    let outcome = client::run(&handle).await;
    handle.dispose();
    task.await.context("session task failed")?;
    outcome.context("interactive client failed")
}

async fn inject_from(path: &Path, handle: &SessionHandle, submit: bool) -> Result<()> {
    let state = handle
        .wait_for_state(|state| {
            matches!(state.connection, ConnectionState::Open | ConnectionState::Closed)
        })
        .await;
    if state.connection != ConnectionState::Open {
        return Ok(());
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if path == Path::new("-") {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };
    let delivered = client::inject::pump_lines(reader, handle, submit).await?;
    info!(target = "main", delivered, "injection finished");
    Ok(())
}

async fn serve(args: ServeArgs, logging_args: &LoggingArgs) -> Result<()> {
    telemetry::init(&logging_args.to_config()).context("failed to initialise logging")?;

    let mut config = HostConfig::new(args.listen);
    if !args.cmd.is_empty() {
        config.command = args.cmd;
    }
    host::serve(config).await.context("shell host stopped")
}
