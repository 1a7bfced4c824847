use branchdb::{Config, Mode, Server};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind, or a filesystem path with --unix-socket in the config
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 9090)]
    port: u16,

    /// Config file path
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Operating mode: STANDALONE or CLUSTER
    #[arg(short = 'm', long)]
    mode: Option<Mode>,

    /// Enable verbose (debug) logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Announce this node to a seed node's bus port (HOST's port + 10000)
    Join { host: String, port: u16 },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Start from the config file when given, CLI flags take precedence
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if args.addr != "127.0.0.1" || config.ip_address.is_empty() {
        config.ip_address = args.addr.clone();
    }
    if args.port != 9090 {
        config.ip_port = args.port;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    // Joining implies cluster membership
    if matches!(args.command, Some(Commands::Join { .. })) {
        config.mode = Mode::Cluster;
    }

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_new(format!("branchdb={}", normalize_level(&log_level)))
        .unwrap_or_else(|_| EnvFilter::new("branchdb=info"));

    match config.log_path.as_deref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!(
        "starting branchdb v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.ip_address,
        config.ip_port
    );
    if config.mode == Mode::Cluster {
        info!("cluster mode enabled, bus port {}", config.bus_port());
    }

    let server = Arc::new(Server::new(config)?);

    if let Some(Commands::Join { host, port }) = &args.command {
        info!(host = %host, port = *port, "will announce to seed node");
        server.set_seed(host, *port);
    }

    // SIGINT/SIGTERM unwind every worker loop
    let handle = Arc::clone(&server);
    ctrlc::set_handler(move || {
        warn!("received shutdown signal");
        handle.shutdown();
    })?;

    if let Err(e) = server.run() {
        error!("server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Map the config file's log levels (DEBUG, INFO/INFORMATION, WARNING,
/// ERROR) onto tracing filter directives
fn normalize_level(level: &str) -> &str {
    match level {
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}
