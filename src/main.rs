#![forbid(unsafe_code)]

//! `v8-debug`: attach to a remote V8 VM and log what it does.
//!
//! Loads configuration, attaches a debug session, optionally sets a
//! breakpoint, and logs suspend events until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use v8_remote_debug::protocol::v8::{BreakpointTarget, StepAction};
use v8_remote_debug::session::{BreakpointSpec, DebugContext, Script};
use v8_remote_debug::{AppError, DebugEventListener, DebugSession, DebuggerConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "v8-debug", about = "Remote V8 debugger client", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the remote host.
    #[arg(long)]
    host: Option<String>,

    /// Override the remote port.
    #[arg(long)]
    port: Option<u16>,

    /// Set a breakpoint, as `script:line` (zero-based line).
    #[arg(long)]
    breakpoint: Option<String>,

    /// Resume automatically after every suspend.
    #[arg(long)]
    auto_resume: bool,
}

/// Logs session events; optionally resumes the VM right away.
struct LoggingListener {
    auto_resume: bool,
}

impl DebugEventListener for LoggingListener {
    fn suspended(&self, context: DebugContext) {
        let frames = context.call_frames().unwrap_or_default();
        match frames.first() {
            Some(top) => info!(
                function = %top.function_name,
                script_id = ?top.script_id,
                line = top.line,
                depth = frames.len(),
                "suspended"
            ),
            None => info!("suspended with an empty stack"),
        }
        if let Ok(Some(exception)) = context.exception() {
            warn!(
                uncaught = exception.uncaught,
                text = ?exception.exception.text,
                "stopped on exception"
            );
        }
        if self.auto_resume {
            if let Err(err) = context.continue_vm(StepAction::Continue, 1, |_| {}) {
                error!(%err, "failed to resume");
            }
        }
    }

    fn resumed(&self) {
        info!("resumed");
    }

    fn disconnected(&self) {
        info!("remote disconnected");
    }

    fn script_loaded(&self, script: &Script) {
        info!(script_id = script.id(), name = ?script.name(), "script loaded");
    }

    fn script_collected(&self, script_id: i64) {
        info!(script_id, "script collected");
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("v8-debug bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => DebuggerConfig::load_from_path(path)?,
        None => DebuggerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    info!(host = %config.host, port = config.port, "configuration loaded");

    // ── Attach ──────────────────────────────────────────
    let listener = Arc::new(LoggingListener {
        auto_resume: args.auto_resume,
    });
    let session = DebugSession::from_config(&config, listener)?;
    let scripts = session.attach().await?;
    let version = session.version().await?;
    info!(%version, scripts, "attached to remote VM");

    if let Some(location) = args.breakpoint.as_deref() {
        let spec = parse_breakpoint(location)?;
        let breakpoint = session.set_breakpoint(spec).await?;
        info!(breakpoint_id = breakpoint.id(), %location, "breakpoint set");
    }

    // ── Wait for shutdown ───────────────────────────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = session.connection().closed() => info!("connection closed"),
    }
    session.detach();
    session.connection().closed().await;
    info!("v8-debug shut down");
    Ok(())
}

fn parse_breakpoint(location: &str) -> Result<BreakpointSpec> {
    let (script, line) = location
        .rsplit_once(':')
        .ok_or_else(|| AppError::Config(format!("breakpoint must be script:line, got {location}")))?;
    let line = line
        .parse::<i64>()
        .map_err(|err| AppError::Config(format!("invalid breakpoint line {line}: {err}")))?;
    Ok(BreakpointSpec::new(
        BreakpointTarget::Script(script.to_owned()),
        Some(line),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
