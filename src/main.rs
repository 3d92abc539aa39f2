//! pivot-netstack: userspace network stack behind a TUN interface
//!
//! Opens the interface, terminates every flow routed into it and relays the
//! flows from this host until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (interface pivot0)
//! sudo ./pivot-netstack
//!
//! # Run with a configuration file and a different interface
//! sudo ./pivot-netstack -c /etc/pivot-netstack/config.json -i pivot1
//!
//! # Run with environment overrides
//! PIVOT_LOG_LEVEL=debug sudo ./pivot-netstack
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use pivot_netstack::config::{apply_env_overrides, load_config_with_env, Config};
use pivot_netstack::netstack::NetworkStack;
use pivot_netstack::pool::ConnectionPool;
use pivot_netstack::relay::DirectRelay;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Interface name override
    interface: Option<String>,
    /// Inflight cap override
    max_inflight: Option<usize>,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            interface: None,
            max_inflight: None,
            check_config: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = args.next().map(PathBuf::from);
                }
                "-i" | "--interface" => {
                    parsed.interface = args.next();
                }
                "-m" | "--max-inflight" => match args.next().map(|v| v.parse::<usize>()) {
                    Some(Ok(max)) => parsed.max_inflight = Some(max),
                    _ => {
                        eprintln!("--max-inflight expects a positive integer");
                        std::process::exit(1);
                    }
                },
                "--check" => {
                    parsed.check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("pivot-netstack v{}", pivot_netstack::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }
}

fn print_help() {
    println!(
        r"pivot-netstack v{}

Userspace network stack that terminates traffic routed into a TUN interface.

USAGE:
    pivot-netstack [OPTIONS]

OPTIONS:
    -c, --config <PATH>        Configuration file path
    -i, --interface <NAME>     TUN interface name [default: pivot0]
    -m, --max-inflight <N>     Maximum unaccepted TCP connections [default: 4096]
    --check                    Check configuration and exit
    -h, --help                 Print help information
    -v, --version              Print version information

ENVIRONMENT:
    PIVOT_INTERFACE       Override interface name
    PIVOT_MAX_INFLIGHT    Override inflight cap
    PIVOT_MTU             Override interface MTU
    PIVOT_LOG_LEVEL       Override log level (trace, debug, info, warn, error)

REQUIREMENTS:
    - Linux with /dev/net/tun
    - CAP_NET_ADMIN capability (or root)
",
        pivot_netstack::VERSION
    );
}

/// Load the configuration file (or defaults) and apply overrides
fn load(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => load_config_with_env(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config).context("Invalid environment override")?;
            config
        }
    };

    if let Some(name) = &args.interface {
        config.stack.interface_name.clone_from(name);
    }
    if let Some(max) = args.max_inflight {
        config.stack.max_inflight = max;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    match (config.log.format.as_str(), config.log.timestamps) {
        ("json", true) => subscriber.json().init(),
        ("json", false) => subscriber.json().without_time().init(),
        (_, true) => subscriber.init(),
        (_, false) => subscriber.without_time().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();
    let config = load(&args)?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);
    info!("pivot-netstack v{}", pivot_netstack::VERSION);

    let pool = ConnectionPool::default();
    let stack = NetworkStack::new(&config.stack, Some(pool.clone()))
        .context("Failed to start network stack")?;

    let relay = DirectRelay::new(config.relay.clone());
    let relay_task = {
        let relay = relay.clone();
        let pool = pool.clone();
        tokio::spawn(async move { relay.run(pool).await })
    };

    info!(
        interface = stack.name(),
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }

    // Requests nobody claimed still hold a handshake open on the peer's side.
    let unclaimed = pool.close();
    let count = unclaimed.len();
    for request in unclaimed {
        request.terminate(true);
    }
    if count > 0 {
        info!(count, "Reset unclaimed requests");
    }

    let destroyed = stack.destroy().await;
    if let Err(e) = relay_task.await {
        warn!(error = %e, "Relay task ended abnormally");
    }

    let stats = stack.stats();
    info!(
        "Final stats: {} TCP / {} UDP requests, {} resets, {} echo replies",
        stats.tcp_requests, stats.udp_requests, stats.resets_sent, stats.echo_replies
    );
    let relay_stats = relay.stats();
    info!(
        "Relayed: {} TCP, {} UDP, {} dial failures, {} bytes up, {} bytes down",
        relay_stats.tcp_relayed,
        relay_stats.udp_relayed,
        relay_stats.dial_failures,
        relay_stats.bytes_up,
        relay_stats.bytes_down
    );

    destroyed.context("Failed to release interface")?;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
