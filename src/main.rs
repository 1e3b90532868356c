//! egress-socks: SOCKS5 proxy server with pinned egress
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./egress-socks
//!
//! # Run with custom configuration
//! ./egress-socks -c /path/to/config.json
//!
//! # Run with environment overrides
//! EGRESS_SOCKS_LOG_LEVEL=debug ./egress-socks
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use egress_socks::egress::{OutboundNetworkProvider, SystemNetworkProvider};
use egress_socks::server::{load_config, ServerConfig, Socks5Server};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/egress-socks/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("egress-socks v{}", egress_socks::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"egress-socks v{}

SOCKS5 proxy server that pins outbound traffic to a selectable egress network.

USAGE:
    egress-socks [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/egress-socks/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    EGRESS_SOCKS_LISTEN       Override listen address
    EGRESS_SOCKS_LOG_LEVEL    Override log level (trace, debug, info, warn, error)

EXAMPLE:
    # Serve on the LAN, egress over the wwan0 modem interface
    egress-socks -c config.json   # with "egress_device": "wwan0"
"#,
        egress_socks::VERSION
    );
}

/// Initialize logging from `EGRESS_SOCKS_LOG_LEVEL` and `RUST_LOG`
fn init_logging() {
    let level = match std::env::var("EGRESS_SOCKS_LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load configuration and apply environment overrides
fn load_config_with_env(path: &PathBuf) -> Result<ServerConfig> {
    let mut config = load_config(path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {path:?}: {e}"))?;

    if let Ok(listen) = std::env::var("EGRESS_SOCKS_LISTEN") {
        config.listen = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid EGRESS_SOCKS_LISTEN {listen:?}: {e}"))?;
    }
    Ok(config)
}

/// Build the egress provider named by the configuration
fn build_provider(config: &ServerConfig) -> Arc<dyn OutboundNetworkProvider> {
    match &config.egress_device {
        #[cfg(target_os = "linux")]
        Some(device) => {
            let provider = egress_socks::egress::InterfaceProvider::new(device.clone());
            if !provider.is_available() {
                warn!(device = %device, "egress device not present yet, waiting for hot-plug");
            }
            info!(device = %device, "egress pinned via SO_BINDTODEVICE");
            Arc::new(provider)
        }
        #[cfg(not(target_os = "linux"))]
        Some(device) => {
            warn!(device = %device, "device pinning requires Linux, using default route");
            Arc::new(SystemNetworkProvider)
        }
        None => {
            info!("no egress device configured, using default route");
            Arc::new(SystemNetworkProvider)
        }
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        let config = ServerConfig::new("127.0.0.1:1080".parse()?);
        std::fs::write(&args.config_path, serde_json::to_string_pretty(&config)?)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging();
    info!("egress-socks v{}", egress_socks::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let provider = build_provider(&config);
    let server = Arc::new(Socks5Server::new(config, provider)?);
    let stats = server.stats();

    let serve_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    server.shutdown();
    let serve_result = tokio::time::timeout(Duration::from_secs(5), serve_handle).await;

    let snapshot = stats.snapshot();
    info!(
        "Final stats: {} total sessions, {} bytes transferred",
        snapshot.total_sessions, snapshot.total_bytes
    );
    info!("Shutdown complete");

    match serve_result {
        Ok(joined) => joined?.map_err(Into::into),
        Err(_) => {
            warn!("serve loop did not stop within 5s, exiting anyway");
            Ok(())
        }
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
