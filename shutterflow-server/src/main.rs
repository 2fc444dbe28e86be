use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shutterflow_core::catalog::Catalog;
use shutterflow_core::pipeline::PipelineRunner;
use shutterflow_core::settings::Settings;
use shutterflow_core::syncthing::{ReplicationApi, SyncthingClient};
use shutterflow_server::config::{ConfigLoad, ConfigLoader};
use shutterflow_server::routes;
use shutterflow_server::state::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "shutterflow-server",
    version,
    about = "Batch lifecycle orchestrator for media archival"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the configuration file (overrides the default locations)
    #[arg(long, env = "SHUTTERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Root every pipeline directory and the catalog under this directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one full pipeline cycle and exit
    Run,
    /// Run the cleanup stage once and exit
    Cleanup,
    /// Validate the configuration and probe the replication service
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run) => run_once(&cli.serve).await,
        Some(Command::Cleanup) => run_cleanup(&cli.serve).await,
        Some(Command::Check) => run_check(&cli.serve).await,
        None => run_server(&cli.serve).await,
    }
}

/// Load settings, apply CLI overrides and bring up logging. Warnings are
/// only visible once the subscriber exists, so they are replayed here.
fn load_settings(args: &ServeArgs) -> anyhow::Result<Settings> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(root) = &args.root {
        loader = loader.with_root(root);
    }

    let ConfigLoad {
        mut settings,
        warnings,
        source,
        env_file_loaded,
    } = loader.load().context("failed to load configuration")?;

    if let Some(host) = args.host.clone() {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }
    for warning in &warnings {
        warn!(message = %warning, "configuration warning");
    }

    Ok(settings)
}

struct Bootstrap {
    settings: Settings,
    catalog: Catalog,
    pipeline: PipelineRunner,
}

async fn bootstrap(args: &ServeArgs) -> anyhow::Result<Bootstrap> {
    let settings = load_settings(args)?;

    settings
        .ensure_directories()
        .context("failed to create pipeline directories")?;

    let catalog = Catalog::open(&settings.catalog.db_path)
        .await
        .context("failed to open catalog database")?;

    let client =
        SyncthingClient::new(&settings.syncthing).context("failed to build Syncthing client")?;
    let api: Arc<dyn ReplicationApi> = Arc::new(client);
    let pipeline = PipelineRunner::new(catalog.clone(), api, &settings);

    Ok(Bootstrap {
        settings,
        catalog,
        pipeline,
    })
}

async fn run_once(args: &ServeArgs) -> anyhow::Result<()> {
    let boot = bootstrap(args).await?;
    let report = boot.pipeline.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_cleanup(args: &ServeArgs) -> anyhow::Result<()> {
    let boot = bootstrap(args).await?;
    let report = boot.pipeline.cleanup().run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Validates the configuration and pings the replication service without
/// touching the catalog or creating any directories.
async fn run_check(args: &ServeArgs) -> anyhow::Result<()> {
    let settings = load_settings(args)?;
    let client =
        SyncthingClient::new(&settings.syncthing).context("failed to build Syncthing client")?;
    client
        .ping()
        .await
        .context("replication service check failed")?;
    info!(api_url = %settings.syncthing.api_url, "configuration valid, replication service reachable");
    Ok(())
}

async fn run_server(args: &ServeArgs) -> anyhow::Result<()> {
    let boot = bootstrap(args).await?;
    let api_key = boot.settings.server.api_key.clone();
    if api_key.is_none() {
        warn!("no API key configured; the control surface is unauthenticated");
    }

    let state = AppState::new(boot.catalog, boot.pipeline, api_key);
    let app = routes::create_app(state);

    let addr = format!(
        "{}:{}",
        boot.settings.server.host, boot.settings.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "shutterflow server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received; draining connections");
}
