//! sockmux line-echo daemon
//!
//! Demo host for the dispatch core: accepts TCP clients on a single thread,
//! echoes every complete newline-terminated line back to its sender, and
//! says goodbye to clients that send `QUIT`. Partial lines stay buffered
//! until their newline arrives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use sockmux_core::config::DispatchConfig;
use sockmux_core::conn::Conn;
use sockmux_core::dispatch::Dispatcher;

/// sockmux line echo daemon
#[derive(Parser, Debug)]
#[command(name = "sockmux-echod")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Single-threaded poll-based line echo server", long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Listen address, overrides the configuration file
    #[arg(long)]
    listen: Option<String>,

    /// Listen port, overrides the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Buffer allocation granularity in bytes
    #[arg(long)]
    granularity: Option<usize>,

    /// Per-connection read budget per cycle in bytes
    #[arg(long)]
    read_budget: Option<usize>,

    /// Poll timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,
}

/// Port used when neither the CLI nor a configuration file names one
const DEFAULT_PORT: u16 = 7777;

/// Daemon configuration, loadable from a YAML file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct EchodConfig {
    /// Address the listener binds
    listen: SocketAddr,
    /// Dispatch loop tuning
    dispatch: DispatchConfig,
}

impl Default for EchodConfig {
    fn default() -> Self {
        EchodConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            dispatch: DispatchConfig::default(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    sockmux_core::log::init_logging(&args.log_level, args.no_color);

    log::info!("sockmux-echod v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let mut dispatcher = Dispatcher::new(config.dispatch.clone(), Box::new(line_echo))
        .context("dispatcher setup failed")?;
    let bound = dispatcher
        .listen_on(config.listen)
        .with_context(|| format!("cannot listen on {}", config.listen))?;
    log::info!("echo service ready on {}", bound);

    dispatcher.run(&shutdown).context("dispatch loop failed")?;

    log::info!("sockmux-echod stopped");
    Ok(())
}

/// Build the effective configuration: file values first, CLI flags on top
fn load_config(args: &Args) -> Result<EchodConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("loading configuration from {}", path);
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path))?
        }
        None => EchodConfig::default(),
    };

    if let Some(addr) = &args.listen {
        let ip = addr
            .parse()
            .with_context(|| format!("invalid listen address {}", addr))?;
        config.listen.set_ip(ip);
    }
    if let Some(port) = args.port {
        config.listen.set_port(port);
    }
    if let Some(granularity) = args.granularity {
        config.dispatch.granularity = granularity;
    }
    if let Some(budget) = args.read_budget {
        config.dispatch.read_budget = budget;
    }
    if let Some(timeout) = args.timeout_ms {
        config.dispatch.poll_timeout_ms = timeout;
    }

    Ok(config)
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to set signal handler")?;

    Ok(())
}

/// Echo complete lines back to their sender. A line reading `QUIT` queues a
/// farewell and stops the connection; whatever follows it is discarded.
fn line_echo(conn: &mut Conn) -> i64 {
    let data = conn.inbuf.data();
    let upto = match data.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => return 0,
    };

    let mut consumed = 0i64;
    for line in data[..upto].split_inclusive(|&b| b == b'\n') {
        if trim_line(line) == b"QUIT" {
            conn.outbuf.append(b"bye\n");
            return -1;
        }
        conn.outbuf.append(line);
        consumed += line.len() as i64;
    }
    consumed
}

/// Strip the trailing newline and any carriage return before it
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
