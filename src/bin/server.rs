use gpu_job_metrics::db::JobMetricStore;
use gpu_job_metrics::db::services::{PgJobMetricStore, ensure_schema};
use gpu_job_metrics::gpu::{CaptureService, GpuLookupService};
use gpu_job_metrics::prometheus::{MetricsSource, PrometheusClient};
use gpu_job_metrics::server::config::ServerConfig;
use gpu_job_metrics::version::VERSION;
use gpu_job_metrics::web::{AppState, create_axum_router};

use clap::Parser;
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "server.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        return;
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Manually check for --version before full parsing to keep the output simple.
    if std::env::args().any(|arg| arg == "--version") {
        println!("Server version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();

    // The log directory comes from the config, so a config error is reported on stderr.
    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&server_config.log_dir);
    info!("Starting server, version: {}", VERSION);

    // --- Database Pool Setup ---
    let store: Option<Arc<dyn JobMetricStore>> = match &server_config.database_url {
        Some(database_url) => {
            let mut opt = ConnectOptions::new(database_url.to_owned());
            opt.max_connections(10).sqlx_logging(false);
            let db_pool = Database::connect(opt).await?;
            ensure_schema(&db_pool).await?;
            info!("Database connected and job_gpu_metrics schema ensured.");
            Some(Arc::new(PgJobMetricStore::new(db_pool)))
        }
        None => {
            warn!("DATABASE_URL not set. GPU capture and overview are unavailable.");
            None
        }
    };

    // --- Prometheus Client Setup ---
    let source: Option<Arc<dyn MetricsSource>> = match &server_config.prometheus_url {
        Some(url) => {
            let client = PrometheusClient::new(url, server_config.prometheus_timeout)?;
            info!(prometheus_url = %url, "Prometheus client configured.");
            Some(Arc::new(client))
        }
        None => {
            warn!("PROMETHEUS_URL not set. Live GPU lookups are unavailable.");
            None
        }
    };

    let capture = Arc::new(CaptureService::new(
        source.clone(),
        store.clone(),
        server_config.integrations,
        server_config.capture.clone(),
        server_config.metrics.clone(),
    ));
    let lookup = Arc::new(GpuLookupService::new(
        source,
        store,
        server_config.integrations,
        server_config.capture.clone(),
        server_config.metrics.clone(),
    ));

    // --- Periodic Capture Task ---
    if let Some(period) = server_config.capture_interval {
        tokio::spawn(capture.clone().run_periodic(period));
    }

    let app = create_axum_router(Arc::new(AppState { capture, lookup }));

    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr).await?;
    info!(address = %server_config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Box::new)?;

    info!("Server stopped.");
    Ok(())
}
