use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use tailhub::config::{DashboardConfig, Profiles};
use tailhub::{follower, server, AppState, Hub, HubConfig, OverflowPolicy, SessionGate, WatchMode};

#[derive(Parser, Debug)]
#[command(name = "tailhub")]
#[command(about = "Stream the tail of log files to the browser", long_about = None)]
#[command(version)]
struct Cli {
    /// Port for the web server
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Dashboard configuration (JSON)
    #[arg(short, long, default_value = "dashboard.json")]
    config: PathBuf,

    /// Directory holding <profile>.json highlight rule files
    #[arg(long, default_value = "configs")]
    profiles_dir: PathBuf,

    /// Lines of history kept per log for newly connected clients
    #[arg(long, default_value_t = tailhub::hub::DEFAULT_HISTORY_LEN)]
    history: usize,

    /// How followed files are watched for changes
    #[arg(long, value_enum, default_value_t = Watch::Poll)]
    watch: Watch,

    /// Polling interval, and fallback check interval in native mode
    #[arg(long, default_value_t = 250)]
    poll_interval_ms: u64,

    /// Lines a client may have queued before the overflow policy applies
    #[arg(long, default_value_t = tailhub::hub::DEFAULT_CLIENT_QUEUE)]
    client_queue: usize,

    /// What to do with a client that falls behind
    #[arg(long, value_enum, default_value_t = Overflow::DropOldest)]
    overflow: Overflow,

    /// Seconds a single write to a client may take before it is disconnected
    #[arg(long, default_value_t = 10)]
    write_timeout_secs: u64,

    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Watch {
    Poll,
    Native,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Overflow {
    DropOldest,
    Disconnect,
}

impl Cli {
    fn watch_mode(&self) -> WatchMode {
        let interval = Duration::from_millis(self.poll_interval_ms.max(1));
        match self.watch {
            Watch::Poll => WatchMode::Poll { interval },
            Watch::Native => WatchMode::Native { fallback: interval },
        }
    }

    fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            Overflow::DropOldest => OverflowPolicy::DropOldest,
            Overflow::Disconnect => OverflowPolicy::Disconnect,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,hyper=debug,tower=debug", // -vvv shows everything including dependencies
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("tailhub started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let config = DashboardConfig::load(&cli.config);
    let sources = config.sources();
    let profiles = Profiles::load(&cli.profiles_dir, &sources);
    info!(logs = sources.len(), profiles = profiles.len(), "configuration loaded");

    let gate = SessionGate::new(config.password());
    if gate.is_open() {
        warn!("no server password configured, dashboard is open to anyone who can reach it");
    } else {
        info!("session gate enabled");
    }

    let hub = Hub::new(HubConfig {
        sources: sources.len(),
        history_len: cli.history,
        client_queue: cli.client_queue.max(1),
        overflow: cli.overflow_policy(),
    });

    let state = match AppState::new(
        hub.clone(),
        gate,
        server::dashboard_entries(&sources, &profiles),
    ) {
        Ok(state) => state.with_write_timeout(Duration::from_secs(cli.write_timeout_secs.max(1))),
        Err(e) => {
            error!("Fatal error: {}", e);
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::new(cli.bind, cli.port);
    let listener = match server::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Fatal error: {}", e);
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel(follower::INGEST_QUEUE);
    tokio::spawn({
        let hub = hub.clone();
        async move { hub.run(rx).await }
    });
    // Backlogs are in the hub before the first connection is accepted.
    follower::spawn_followers(&sources, &hub, &tx, cli.watch_mode()).await;
    drop(tx);

    if let Err(e) = server::serve(listener, state, shutdown_signal()).await {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
