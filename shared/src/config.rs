//! Configuration types and validation for the scraping daemon
//!
//! This module defines the configuration structure loaded from scraped.toml,
//! including validation logic and serialization support.

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Main daemon configuration loaded from scraped.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedConfig {
    /// Path to the SQLite database holding sites, cameras and scrape records
    pub database_path: String,
    /// Root of the scraped image tree; images land at
    /// {image_root}/{site}/{camera}/{unix_seconds}.{ext}
    #[serde(default = "default_image_root")]
    pub image_root: String,
    /// User-Agent header sent with every camera request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Which astronomical data provider to use: "local" or "usno"
    #[serde(default = "default_astro_provider")]
    pub astro_provider: String,
    /// SQLite database busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// Wait time for in-flight scrapes during shutdown in seconds (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Image processing settings
    #[serde(default)]
    pub image: ImageConfig,
    /// Planner retry policy
    #[serde(default)]
    pub scheduling: SchedulingConfig,
}

/// Settings related to processing scraped images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    /// Maximum stored width in pixels; larger downloads are resized
    #[serde(default = "default_image_width")]
    pub width: u32,
    /// Maximum stored height in pixels; larger downloads are resized
    #[serde(default = "default_image_height")]
    pub height: u32,
    /// JPEG quality, 1-100
    #[serde(default = "default_image_quality")]
    pub quality: u8,
    /// Whether to suppress images visually identical to the previous success
    #[serde(default)]
    pub equality_testing: bool,
    /// Per-pixel CIELAB delta-E above which two images are considered different
    #[serde(default = "default_equality_tolerance")]
    pub equality_tolerance: f64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: default_image_width(),
            height: default_image_height(),
            quality: default_image_quality(),
            equality_testing: false,
            equality_tolerance: default_equality_tolerance(),
        }
    }
}

/// Settings related to the per-site day planner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingConfig {
    /// Maximum attempts to plan a day's scrapes before deferring to the next day
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait between planning attempts in minutes
    #[serde(default = "default_wait_time_minutes")]
    pub wait_time_minutes: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wait_time_minutes: default_wait_time_minutes(),
        }
    }
}

impl ScrapedConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.database_path.is_empty() {
            return Err(
                crate::ScrapedError::Validation("database_path cannot be empty".to_string())
                    .into(),
            );
        }

        if self.image_root.is_empty() {
            return Err(
                crate::ScrapedError::Validation("image_root cannot be empty".to_string()).into(),
            );
        }

        if self.user_agent.is_empty() {
            return Err(
                crate::ScrapedError::Validation("user_agent cannot be empty".to_string()).into(),
            );
        }

        if self.request_timeout_seconds == 0 {
            return Err(crate::ScrapedError::Validation(
                "request_timeout_seconds must be at least 1".to_string(),
            )
            .into());
        }

        match self.astro_provider.as_str() {
            "local" | "usno" => {}
            other => {
                return Err(crate::ScrapedError::Validation(format!(
                    "astro_provider must be \"local\" or \"usno\", got \"{}\"",
                    other
                ))
                .into());
            }
        }

        self.image.validate()?;
        self.scheduling.validate()?;

        Ok(())
    }
}

impl ImageConfig {
    /// Validate the image processing settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(crate::ScrapedError::Validation(
                "image width and height must be greater than 0".to_string(),
            )
            .into());
        }

        if self.quality == 0 || self.quality > 100 {
            return Err(crate::ScrapedError::Validation(
                "image quality must be between 1 and 100".to_string(),
            )
            .into());
        }

        if self.equality_testing && self.equality_tolerance <= 0.0 {
            return Err(crate::ScrapedError::Validation(
                "equality_tolerance must be greater than 0 when equality_testing is enabled"
                    .to_string(),
            )
            .into());
        }

        Ok(())
    }
}

impl SchedulingConfig {
    /// Validate the planner retry policy
    pub fn validate(&self) -> crate::Result<()> {
        if self.wait_time_minutes < 0 {
            return Err(crate::ScrapedError::Validation(
                "wait_time_minutes cannot be negative".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
