//! Configuration management for the scraping daemon
//!
//! Loads and validates `scraped.toml` from the configuration directory and
//! keeps a checksum of the raw content so callers can cheaply detect
//! changes on disk.

use anyhow::{Context, Result};
use shared::{config::ScrapedConfig, utils::calculate_checksum};
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration file name, a constant to avoid magic strings.
const CONFIG_FILE: &str = "scraped.toml";

/// Manages daemon configuration loading and validation.
pub struct ConfigManager {
    /// Directory containing configuration files.
    pub config_dir: PathBuf,
    /// Loaded daemon configuration; `None` until `load_config` succeeds.
    pub config: Option<ScrapedConfig>,
    /// Checksum of the configuration file content, used to detect changes
    /// without parsing the file again.
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager, validating that the directory
    /// exists up front so a misconfigured path fails with a clear message.
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            return Err(anyhow::anyhow!(
                "Configuration directory does not exist: {}",
                config_dir.display()
            ));
        }

        if !config_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Configuration path is not a directory: {}",
                config_dir.display()
            ));
        }

        Ok(Self {
            config_dir,
            config: None,
            current_checksum: None,
        })
    }

    /// Load `scraped.toml` from disk, parse, validate, and remember a
    /// checksum of the raw content.
    pub async fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading daemon configuration from {}",
            self.config_dir.display()
        );

        let config_path = self.config_dir.join(CONFIG_FILE);
        let toml_content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: ScrapedConfig = toml::from_str(&toml_content).with_context(|| {
            format!(
                "Failed to parse {} - TOML syntax error in daemon configuration file",
                config_path.display()
            )
        })?;

        config.validate().with_context(|| {
            format!(
                "Validation failed for daemon configuration in {}",
                config_path.display()
            )
        })?;

        let checksum = calculate_checksum(&toml_content);

        debug!("Daemon configuration parameters (including defaults):");
        debug!("  database_path: {}", config.database_path);
        debug!("  image_root: {}", config.image_root);
        debug!("  user_agent: {}", config.user_agent);
        debug!(
            "  request_timeout_seconds: {}",
            config.request_timeout_seconds
        );
        debug!("  astro_provider: {}", config.astro_provider);
        debug!(
            "  graceful_shutdown_timeout_seconds: {}",
            config.graceful_shutdown_timeout_seconds
        );
        debug!(
            "  image: {}x{} quality={} equality_testing={} tolerance={}",
            config.image.width,
            config.image.height,
            config.image.quality,
            config.image.equality_testing,
            config.image.equality_tolerance
        );
        debug!(
            "  scheduling: max_attempts={} wait_time_minutes={}",
            config.scheduling.max_attempts, config.scheduling.wait_time_minutes
        );

        self.config = Some(config);
        self.current_checksum = Some(checksum);

        info!(
            checksum = %self.current_checksum.as_deref().unwrap_or_default(),
            "Configuration loaded successfully"
        );

        Ok(())
    }

    /// Check if the configuration has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }
}
