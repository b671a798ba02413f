use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use meshrelay::config::{self, Config, NodeRole};
use meshrelay::network::CoreNodeServer;
use meshrelay::rpc::{RpcHandler, RpcServer};
use meshrelay::shutdown::ShutdownManager;
use meshrelay::AppBuilder;

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(about = "Transaction relay daemon (core, relay or bridge node)", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    /// Role used when generating a new config
    #[arg(long)]
    role: Option<NodeRole>,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Print hostname at startup BEFORE any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    let config_path = args.config.clone().unwrap_or_else(|| {
        config::get_data_dir()
            .join("relayd.toml")
            .to_string_lossy()
            .into_owned()
    });
    let role = args.role.unwrap_or(NodeRole::Relay);

    if args.generate_config {
        let config = Config::generate(role);
        match config.save_to_file(&config_path) {
            Ok(()) => {
                println!("✅ Generated default {:?} config at: {}", role, config_path);
                println!("  └─ Node ID: {}", config.node.node_id);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&config_path, role) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", config_path);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(addr) = args.listen_addr {
        config.network.listen_address = addr;
    }
    if args.role.is_some_and(|r| r != config.node.role) {
        eprintln!(
            "⚠️  --role {:?} ignored: {} already configures a {:?} node",
            role, config_path, config.node.role
        );
    }

    // Keeps the file writer flushing until main returns
    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");

    println!("\n🚀 Relay Daemon v{} ({})", version, git_hash);
    println!("  └─ Build: {}", build_date);
    println!("═══════════════════════════════════════════════════════");
    println!("🆔 Node: {} ({:?})", config.node.node_id, config.node.role);
    println!("  └─ Partition: {}", config.node.partition);
    println!("  └─ Listen: {}", config.network.listen_address);
    println!();

    let ctx = match AppBuilder::new(config).build() {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!("❌ Failed to initialize node: {}", e);
            std::process::exit(1);
        }
    };

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    if let Some(core) = ctx.core.clone() {
        let server = match CoreNodeServer::bind(&ctx.config.network.listen_address, core).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(
                    "❌ Failed to bind core listener on {}: {}",
                    ctx.config.network.listen_address,
                    e
                );
                std::process::exit(1);
            }
        };
        let token = shutdown_token.clone();
        shutdown_manager.spawn("core-server", async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("❌ Core listener failed: {}", e);
            }
        });
    }

    let sweep_interval = Duration::from_millis(ctx.config.heartbeat.sweep_interval_ms);
    shutdown_manager.spawn(
        "registry-sweeper",
        ctx.clone().run_sweeper(sweep_interval, shutdown_token.clone()),
    );

    tracing::info!(
        "💓 Probing {} core node(s) every {}ms",
        ctx.probe_targets.len(),
        ctx.config.network.probe_interval_ms
    );
    shutdown_manager.spawn("health-prober", ctx.prober().run(shutdown_token.clone()));

    if ctx.config.rpc.enabled {
        let handler = Arc::new(RpcHandler::new(ctx.clone()).with_shutdown(shutdown_token.clone()));
        let server = match RpcServer::bind(&ctx.config.rpc.listen_address, handler).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(
                    "❌ Failed to bind RPC server on {}: {}",
                    ctx.config.rpc.listen_address,
                    e
                );
                std::process::exit(1);
            }
        };
        let token = shutdown_token.clone();
        shutdown_manager.spawn("rpc-server", async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("❌ RPC server failed: {}", e);
            }
        });
    } else {
        tracing::info!("RPC disabled in config");
    }

    tracing::info!(
        "✅ {} running with {} task(s)",
        ctx.node_id(),
        shutdown_manager.task_count()
    );
    shutdown_manager.wait_for_shutdown().await;
    tracing::info!("👋 {} stopped", ctx.node_id());
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let (writer, guard, to_file) = match config.output.as_str() {
        "file" => {
            let path = std::path::Path::new(&config.file_path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "relayd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), true)
        }
        _ => (BoxMakeWriter::new(std::io::stdout), None, false),
    };

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .with_writer(writer)
                .init();
        }
        _ => {
            if is_systemd && !to_file {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .with_writer(writer)
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(!to_file)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .with_writer(writer)
                    .compact()
                    .init();
            }
        }
    }

    guard
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        use chrono::Utc;
        let now = Utc::now();

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
