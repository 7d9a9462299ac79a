use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orbweaver::backend::{
    Backend, BackendCriteria, BackendRegistry, BackendSelector, BackendSource, HttpBackend,
};
use orbweaver::config::Config;
use orbweaver::coordinator::CoordinatorServer;
use orbweaver::distributed::{DistributedCrawlManager, LocalCluster};
use orbweaver::models::WorkerTask;

#[derive(Parser)]
#[command(
    name = "orbweaver",
    version,
    about = "Distributed crawl orchestration with pluggable backends",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (environment variables are used otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl seed URLs with in-process workers and print the final status
    Run {
        /// Seed URL (repeatable)
        #[arg(short, long = "url", required = true)]
        urls: Vec<String>,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Crawl depth; links are followed while depth is above 1
        #[arg(short, long, default_value = "1")]
        depth: u32,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Serve the coordinator API with in-process workers until Ctrl-C
    Serve {
        /// Bind address, overrides the config
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Number of in-process workers (0 for remote workers only)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show which backend would handle a URL
    Select {
        /// URL to route
        #[arg(short, long)]
        url: String,

        /// Content type hint
        #[arg(long)]
        content_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run {
            urls,
            workers,
            depth,
            timeout,
        } => {
            if let Some(workers) = workers {
                config.worker.workers = workers;
            }
            config.validate()?;
            tracing::info!(seeds = urls.len(), depth = depth, workers = config.worker.workers, "Starting run command");
            run(config, urls, depth, timeout.map(Duration::from_secs)).await?;
        }

        Commands::Serve { bind, workers } => {
            if let Some(bind) = bind {
                config.api.bind_address = bind;
            }
            let workers = workers.unwrap_or(config.worker.workers);
            if workers > 0 {
                config.worker.workers = workers;
            }
            config.validate()?;
            tracing::info!(address = %config.api.bind_address, workers = workers, "Starting serve command");
            serve(config, workers).await?;
        }

        Commands::Select { url, content_type } => {
            select(&config, &url, content_type.as_deref())?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("orbweaver=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("orbweaver={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

/// Registry with the reference HTTP backend
fn default_registry(config: &Config) -> Result<Arc<BackendRegistry>> {
    let registry = Arc::new(BackendRegistry::new());
    let http = config.http.clone();

    registry.register_backend(
        "http",
        BackendSource::factory(move || {
            let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new("http", http.clone())?);
            Ok(backend)
        }),
        Some(BackendCriteria::new().with_content_types([
            "text/html",
            "application/xhtml+xml",
            "text/plain",
            "application/json",
            "application/xml",
            "text/xml",
        ])),
    )?;

    Ok(registry)
}

fn init_metrics(config: &Config) {
    if !config.distributed.enable_metrics {
        return;
    }
    if let Err(e) = orbweaver::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }
}

async fn run(config: Config, urls: Vec<String>, depth: u32, timeout: Option<Duration>) -> Result<()> {
    init_metrics(&config);
    let registry = default_registry(&config)?;
    let cluster = LocalCluster::start(&config, registry, None)?;

    for url in urls {
        cluster
            .submit(WorkerTask::new(url.clone(), depth))
            .with_context(|| format!("Failed to queue {url}"))?;
    }

    let finished = tokio::select! {
        finished = cluster.wait_until_idle(Duration::from_millis(200), timeout) => finished,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, shutting down");
            false
        }
    };
    if !finished {
        tracing::warn!("Stopping with work still queued");
    }

    let status = cluster.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn serve(config: Config, workers: usize) -> Result<()> {
    init_metrics(&config);

    let cluster = if workers > 0 {
        Some(LocalCluster::start(&config, default_registry(&config)?, None)?)
    } else {
        None
    };

    let manager = match &cluster {
        Some(cluster) => Arc::clone(cluster.manager()),
        None => {
            let manager = Arc::new(DistributedCrawlManager::new(config.distributed.clone()));
            manager.start();
            manager
        }
    };

    let server = CoordinatorServer::new(Arc::clone(&manager), config.api.clone());
    let served = server
        .start_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await;

    match cluster {
        Some(cluster) => {
            cluster.shutdown().await;
        }
        None => manager.shutdown().await,
    }

    served?;
    Ok(())
}

fn select(config: &Config, url: &str, content_type: Option<&str>) -> Result<()> {
    let registry = default_registry(config)?;
    let selector = BackendSelector::new(Arc::clone(&registry));

    match selector.select(url, content_type) {
        Some(name) => {
            let criteria = registry.criteria(&name);
            println!("{name}");
            if let Some(criteria) = criteria {
                println!("{}", serde_json::to_string_pretty(&criteria)?);
            }
        }
        None => println!("no backend matches {url}"),
    }

    Ok(())
}
