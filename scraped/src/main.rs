//! Webcam scraping daemon
//!
//! A long-running service that periodically captures images from remote
//! webcams. A per-site day planner consults astronomical data and operator
//! authored rules templates to decide which capture times to schedule; a
//! time-ordered scheduler dispatches the resulting scrape tasks, each of
//! which downloads, processes and archives one image and records the outcome.
// This is the main entry point. It is responsible for:
// - Initializing logging and configuration.
// - Setting up the shared `App` state (store, scheduler, astro provider).
// - Seeding one day planner per site.
// - Managing the application's lifecycle, including graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

// The daemon is organized into several modules, each with a distinct responsibility.
mod clock;
mod config;
mod database;
mod scheduler;
mod task_plan;
mod task_scrape;

#[cfg(test)]
mod tests;

use clock::SystemClock;
use config::ConfigManager;
use database::ScrapeDatabase;
use scheduler::{Scheduler, SchedulerConfig};
use shared::astro::{AstroProvider, LocalProvider, UsnoProvider};
use shared::config::ScrapedConfig;

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "scraped")]
#[command(about = "Daemon that periodically scrapes and archives webcam images", long_about = None)]
struct CliArgs {
    /// Path to the configuration directory containing scraped.toml
    #[arg(value_name = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Override the image root directory from the config file
    #[arg(long = "image-root", value_name = "DIR")]
    image_root: Option<String>,

    /// Override the astronomical data provider ("local" or "usno")
    #[arg(long = "astro-provider", value_name = "PROVIDER")]
    astro_provider: Option<String>,
}

/// Shared application state handed to every planner and scrape task.
pub struct App {
    pub config: ScrapedConfig,
    pub database: Arc<Mutex<ScrapeDatabase>>,
    pub scheduler: Scheduler,
    pub astro: Arc<dyn AstroProvider>,
    /// Shared HTTP client for camera downloads, reused across all requests
    /// so connections are pooled. The request timeout is applied per-request.
    pub client: reqwest::Client,
}

impl App {
    /// Build the application: load and validate configuration, open and
    /// initialize the store, pick the astro provider, and construct the
    /// scheduler.
    pub async fn new(
        config_dir: PathBuf,
        image_root_override: Option<String>,
        astro_provider_override: Option<String>,
    ) -> Result<Arc<Self>> {
        let mut config_manager = ConfigManager::new(config_dir)?;
        config_manager.load_config().await?;
        let mut config = config_manager
            .config
            .clone()
            .ok_or_else(|| anyhow::anyhow!("configuration not loaded"))?;

        // Apply command-line overrides (in memory only)
        if let Some(image_root) = image_root_override {
            info!(
                "Overriding image_root: {} -> {}",
                config.image_root, image_root
            );
            config.image_root = image_root;
        }
        if let Some(provider) = astro_provider_override {
            info!(
                "Overriding astro_provider: {} -> {}",
                config.astro_provider, provider
            );
            config.astro_provider = provider;
        }
        config
            .validate()
            .context("Invalid configuration after applying command-line overrides")?;

        let database = Arc::new(Mutex::new(ScrapeDatabase::new(
            &config.database_path,
            config.database_busy_timeout_seconds,
        )?));
        {
            let mut db = database.lock().await;
            db.initialize().await?;
        }
        info!("Database initialized successfully");

        let astro: Arc<dyn AstroProvider> = match config.astro_provider.as_str() {
            "usno" => Arc::new(UsnoProvider::new()?),
            _ => Arc::new(LocalProvider),
        };
        info!(provider = %config.astro_provider, "Astronomical data provider selected");

        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create shared HTTP client for camera downloads")?;

        let scheduler = Scheduler::new(
            SchedulerConfig {
                wait_timeout_on_cancel: std::time::Duration::from_secs(
                    config.graceful_shutdown_timeout_seconds,
                ),
                stop_on_empty_queue: false,
            },
            Arc::new(SystemClock),
        );

        Ok(Arc::new(Self {
            config,
            database,
            scheduler,
            astro,
            client,
        }))
    }

    /// Start the scheduler, seed one day planner per site, and block until
    /// the scheduler driver exits.
    pub async fn run(self: &Arc<Self>, cancel: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.start(cancel);

        let sites = {
            let mut db = self.database.lock().await;
            db.sites().await.context("reading sites at startup")?
        };
        if sites.is_empty() {
            warn!("no sites in the store; the scheduler will idle until cancelled");
        }
        for site in &sites {
            info!(site = %site.name, "seeding day planner");
            self.scheduler.add(task_plan::plan_task(
                site.id,
                0,
                Arc::clone(self),
                chrono::Utc::now(),
            ));
        }

        // block on the scheduler; planners keep it loaded from here on
        self.scheduler.wait().await;
        Ok(())
    }
}

// The `#[tokio::main]` attribute transforms the `async fn main` into a synchronous
// `fn main` that initializes a tokio runtime and runs the async code.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the logging framework (`tracing`).
    let file_appender = tracing_appender::rolling::daily("./logs", "scraped.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Configure logging with proper RUST_LOG environment variable handling
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default directives are only used if RUST_LOG is not set
        tracing_subscriber::EnvFilter::new("scraped=info,shared=info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    // Parse command-line arguments
    let cli_args = CliArgs::parse();

    info!("Webcam scraping daemon starting up");
    info!("Configuration directory: {}", cli_args.config_dir.display());
    if cli_args.image_root.is_some() {
        info!("Image root override provided via command line");
    }
    if cli_args.astro_provider.is_some() {
        info!("Astro provider override provided via command line");
    }

    // Create and initialize the `App`. If this fails, log the error chain and
    // exit, as the daemon cannot run without successful initialization.
    let app = match App::new(
        cli_args.config_dir,
        cli_args.image_root,
        cli_args.astro_provider,
    )
    .await
    {
        Ok(app) => app,
        Err(e) => {
            error!("FATAL ERROR: Failed to initialize daemon");
            error!("Error: {}", e);

            // Print the full error chain to show all context
            let mut current_error = e.source();
            while let Some(err) = current_error {
                error!("  Caused by: {}", err);
                current_error = err.source();
            }

            error!("Daemon startup ABORTED. Please fix the errors above and try again.");
            std::process::exit(1);
        }
    };

    // Shutdown channel: INT/TERM cancels the scheduler, which stops
    // dispatching and waits for in-flight scrapes.
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Set up signal handling for graceful shutdown. This is crucial for a
    // long-running service to be able to shut down cleanly.
    let shutdown_signal = async {
        // On Unix-like systems (Linux, macOS), we listen for SIGTERM and SIGINT.
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

            // `tokio::select!` waits for the first branch to complete.
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                },
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                },
            }
        }

        // On other systems (like Windows), we listen for Ctrl+C.
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            info!("Received Ctrl+C");
        }
    };

    // Run the daemon and the shutdown signal handler concurrently; the first
    // to complete exits the `select!` block.
    tokio::select! {
        result = app.run(shutdown_rx) => {
            if let Err(e) = result {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
            // The driver stops dispatching and waits for in-flight scrapes
            // up to the configured graceful shutdown timeout.
            app.scheduler.wait().await;
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
