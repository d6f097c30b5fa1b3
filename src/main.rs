//! Meridian demo server.
//!
//! Serves `EchoService` over REST and native RPC (JSON-RPC 2.0 over
//! WebSocket) from one process, with spans mirrored into the log, an
//! in-memory segment recorder and an error reporter.
//!
//! Usage:
//!   meridian                                  # REST on 9282, RPC on 9281
//!   meridian --http-port 8080 --no-rpc        # REST only
//!   meridian --verbose --log-json             # debug logs as JSON
//!
//! Ctrl+C stops the server; SIGHUP reinitializes it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meridian::echo;
use meridian_server::{DefaultServer, ServerConfig};
use meridian_trace::{ErrorReporter, LogBackend, SegmentRecorder, Tracer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Meridian: one RPC service over native RPC and HTTP")]
struct Cli {
    /// Name reported in logs
    #[arg(long, default_value = "meridian")]
    service_name: String,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// REST port (0 for OS-assigned)
    #[arg(long, default_value = "9282")]
    http_port: u16,

    /// Native RPC port (0 for OS-assigned)
    #[arg(long, default_value = "9281")]
    rpc_port: u16,

    /// Disable the REST listener
    #[arg(long)]
    no_http: bool,

    /// Disable the native RPC listener
    #[arg(long)]
    no_rpc: bool,

    /// Seconds to drain in-flight calls on shutdown
    #[arg(long, default_value = "15")]
    shutdown_timeout_secs: u64,

    /// Maximum concurrent RPC connections
    #[arg(long, default_value = "256")]
    max_connections: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            service_name: self.service_name.clone(),
            hostname: self.hostname.clone(),
            http_port: (!self.no_http).then_some(self.http_port),
            rpc_port: (!self.no_rpc).then_some(self.rpc_port),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            max_connections: Some(self.max_connections),
            ..ServerConfig::default()
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let builder = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            if cli.log_json {
                builder.json().init();
            } else {
                builder.init();
            }
            eprintln!("Logging to {}", path.display());
        }
        None if cli.log_json => builder.json().init(),
        None => builder.init(),
    }
    Ok(())
}

async fn reinit_on_hangup(server: DefaultServer) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!("Cannot listen for SIGHUP: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received");
            if let Err(e) = server.reinit() {
                error!("Reinit failed: {e}");
            }
        }
    }
    #[cfg(not(unix))]
    drop(server);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let config = cli.server_config();

    let recorder = SegmentRecorder::new();
    let (reporter, reports) = ErrorReporter::new(256);
    tokio::spawn(ErrorReporter::drain_to_log(reports));
    let tracer = Tracer::builder()
        .backend(LogBackend::new())
        .backend(recorder.clone())
        .backend(reporter.clone())
        .build();

    let server = DefaultServer::with_tracer(config.clone(), Arc::new(tracer));
    echo::install(&server)?;
    server.start().await?;

    println!();
    println!("  {} running", config.service_name);
    if let Some(port) = server.http_port() {
        println!("  REST:  http://{}:{port}/api/1.0/upper/{{msg}}", config.hostname);
    }
    if let Some(port) = server.rpc_port() {
        println!("  RPC:   ws://{}:{port}/rpc", config.hostname);
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::spawn(reinit_on_hangup(server.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            server.stop(config.shutdown_timeout).await?;
        }
        result = server.wait() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
        }
    }
    let result = server.wait().await;

    info!(
        "{} spans recorded, {} error reports dropped",
        recorder.ended_count(),
        reporter.dropped()
    );
    result.map_err(Into::into)
}
