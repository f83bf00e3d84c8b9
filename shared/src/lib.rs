//! Shared data structures and utilities for the webcam scraping daemon
//!
//! This crate contains the data model (sites, cameras, scrape records),
//! configuration structures, astronomical data providers, and the template
//! engine used by camera url and rules templates.

pub mod astro;
pub mod config;
pub mod defaults;
pub mod model;
pub mod templates;
pub mod utils;

// Re-export commonly used types for convenience
pub use astro::{AstroData, AstroProvider, Phenom};
pub use config::ScrapedConfig;
pub use model::{Camera, Scrape, Site};
pub use utils::calculate_checksum;

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the scraping daemon
#[derive(Debug, thiserror::Error)]
pub enum ScrapedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Astronomy provider error: {0}")]
    Astro(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
