//! Wirescope - policy-driven network traffic sensor
//!
//! Loads taps and policies from a YAML configuration, runs the resulting
//! capture inputs and stream handlers, and serves their metrics over HTTP.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wirescope_core::{ConfigLoader, CoreRegistry, PluginRegistry, SensorSettings, WirescopeConfig};
use wirescope_web::WebConfig;

#[derive(Parser)]
#[command(name = "wirescope")]
#[command(author = "Wirescope Developers")]
#[command(version)]
#[command(about = "Policy-driven network traffic sensor", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "WIRESCOPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the configuration and serve the control API until interrupted
    Run(RunArgs),

    /// Validate a configuration by loading it into a throwaway registry
    Check,

    /// List the available input and handler types
    Plugins,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Address the control API binds to
    #[arg(long)]
    host: Option<String>,

    /// Port the control API binds to
    #[arg(short, long)]
    port: Option<u16>,

    /// Allow policies to be created and removed over the API
    #[arg(long)]
    admin_api: bool,

    /// Serve Prometheus metrics at /metrics
    #[arg(long)]
    prometheus: bool,

    /// Set the 'instance' label on Prometheus samples
    #[arg(long, value_name = "ID")]
    prom_instance: Option<String>,

    /// Window periods of history each handler keeps by default
    #[arg(long, value_name = "P", value_parser = clap::value_parser!(u64).range(1..=60))]
    periods: Option<u64>,

    /// Default percentage of packets that get deep analysis
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(0..=100))]
    max_deep_sample: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = ConfigLoader::new().with_cli_path(cli.config.clone()).load();
    let settings = loaded
        .as_ref()
        .map(|config| config.settings.clone())
        .unwrap_or_default();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.verbose, &settings))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = loaded.inspect_err(|e| error!("Failed to load configuration: {}", e))?;

    match cli.command {
        Commands::Run(args) => {
            apply_run_args(&mut config.settings, args);
            let web = WebConfig::from(&config.settings);
            run_command(config, web).await
        }
        Commands::Check => check_command(config).await,
        Commands::Plugins => plugins_command(),
    }
}

/// CLI verbose flag takes precedence, then config `verbose`, then the configured level
fn log_level(verbose: u8, settings: &SensorSettings) -> Level {
    match verbose {
        0 if settings.verbose => Level::DEBUG,
        0 => match settings.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// CLI arguments take precedence when explicitly provided
fn apply_run_args(settings: &mut SensorSettings, args: RunArgs) {
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    settings.admin_api |= args.admin_api;
    settings.prometheus |= args.prometheus;
    if args.prom_instance.is_some() {
        settings.prom_instance = args.prom_instance;
    }
    if args.periods.is_some() {
        settings.periods = args.periods;
    }
    if args.max_deep_sample.is_some() {
        settings.max_deep_sample = args.max_deep_sample;
    }
}

fn control_api_url(web: &WebConfig) -> String {
    format!("http://{}:{}/api/v1", web.host, web.port)
}

fn plugin_registry() -> PluginRegistry {
    let mut plugins = PluginRegistry::new();
    wirescope_capture::register(&mut plugins);
    wirescope_handlers::register(&mut plugins);
    plugins
}

async fn run_command(config: WirescopeConfig, web: WebConfig) -> anyhow::Result<()> {
    let registry = Arc::new(CoreRegistry::new(plugin_registry()));

    match registry.configure(&config).await {
        Ok(summary) => info!(
            taps = summary.taps.len(),
            policies = summary.policies.len(),
            "Sensor configured"
        ),
        Err(e) => {
            error!("Configuration rejected: {}", e);
            registry.teardown().await;
            return Err(e.into());
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let url = control_api_url(&web);
    let metrics_url = web
        .prometheus
        .then(|| format!("http://{}:{}/metrics", web.host, web.port));
    let mut server = tokio::spawn(wirescope_web::start_server(
        web,
        registry.clone(),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    println!();
    println!("  Wirescope v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Control API: {}", url);
    if let Some(metrics_url) = metrics_url {
        println!("  Metrics:     {}", metrics_url);
    }
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            None
        }
        result = &mut server => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Shutting down");
            let _ = shutdown_tx.send(());
            server.await
        }
    };

    registry.teardown().await;
    info!("Sensor stopped");

    result??;
    Ok(())
}

async fn check_command(config: WirescopeConfig) -> anyhow::Result<()> {
    let registry = CoreRegistry::new(plugin_registry());
    let outcome = registry.configure(&config).await;
    registry.teardown().await;

    let summary = outcome?;
    println!("Configuration OK");
    println!("  Taps:     {}", summary.taps.join(", "));
    println!("  Policies: {}", summary.policies.join(", "));
    Ok(())
}

fn plugins_command() -> anyhow::Result<()> {
    let plugins = plugin_registry();

    println!();
    println!("Input types:");
    for (name, description) in plugins.describe_inputs() {
        println!("  {:<12} {}", name, description);
    }

    println!();
    println!("Stream handler types:");
    for (name, description) in plugins.describe_handlers() {
        println!("  {:<12} {}", name, description);
    }
    println!();

    Ok(())
}
