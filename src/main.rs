use chaind::config::{Config, LoggingConfig};
use chaind::consensus::AcceptAll;
use chaind::network::SyncCoordinator;
use chaind::node::Node;
use chaind::shutdown::ShutdownManager;
use clap::Parser;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

/// Nonces tried per mining attempt before re-reading the head
const MINING_BATCH: u64 = 200_000;
const MINING_PAUSE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "chaind")]
#[command(about = "Proof-of-work ledger peer node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override `network.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Override `storage.data_dir`
    #[arg(long)]
    data_dir: Option<String>,

    /// Extra bootstrap peer as host:port; may be repeated
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Mine blocks on top of the adopted chain
    #[arg(long)]
    mine: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    config.network.bootstrap_peers.extend(args.peers);
    let mining = args.mine || config.consensus.mining_enabled;

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    tracing::info!("chaind v{} starting with config {}", version, args.config);

    let node = match Node::new(&config, Arc::new(AcceptAll)).await {
        Ok(node) => Arc::new(node),
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    let mut shutdown_manager = ShutdownManager::new();

    let token = shutdown_manager.token();
    let server_node = Arc::clone(&node);
    shutdown_manager.register_task(tokio::spawn(async move {
        if let Err(e) = server_node.run(token).await {
            tracing::error!("Node stopped with error: {}", e);
        }
    }));

    let token = shutdown_manager.token();
    let sync = SyncCoordinator::new(Arc::clone(&node));
    shutdown_manager.register_task(tokio::spawn(sync.run(token)));

    if mining {
        let token = shutdown_manager.token();
        shutdown_manager.register_task(tokio::spawn(run_miner(Arc::clone(&node), token)));
    }

    tracing::info!(
        "Node {} listening on {} (mining: {})",
        node.name(),
        node.local_addr(),
        mining
    );
    shutdown_manager.wait_for_shutdown().await;
}

async fn run_miner(node: Arc<Node>, shutdown: CancellationToken) {
    tracing::info!("Miner started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = node.mine_block(MINING_BATCH) => {
                if let Err(e) = result {
                    tracing::error!("Mining failed: {}", e);
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(MINING_PAUSE) => {}
        }
    }
    tracing::info!("Miner stopped");
}

fn setup_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = if config.output == "file" {
        let path = std::path::Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "chaind.log".into());
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stdout), None)
    };

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    guard
}

// Custom timer that shows UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
