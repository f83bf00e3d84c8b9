//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! files that don't specify certain optional fields.

// HTTP client defaults

/// Default User-Agent header sent with camera requests
pub fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; scraped/0.9)".to_string()
}

/// Default camera request timeout (60 seconds)
pub fn default_request_timeout() -> u64 {
    60
}

// Image processing defaults

/// Default maximum image width in pixels
pub fn default_image_width() -> u32 {
    1280
}

/// Default maximum image height in pixels
pub fn default_image_height() -> u32 {
    960
}

/// Default JPEG quality (1-100)
pub fn default_image_quality() -> u8 {
    75
}

/// Default perceptual equality tolerance (CIELAB delta-E)
pub fn default_equality_tolerance() -> f64 {
    2.5
}

// Scheduling defaults

/// Default maximum planning attempts per site per day
pub fn default_max_attempts() -> u32 {
    5
}

/// Default wait between planning attempts (10 minutes)
pub fn default_wait_time_minutes() -> i64 {
    10
}

// Daemon defaults

/// Default astronomical data provider ("local" or "usno")
pub fn default_astro_provider() -> String {
    "local".to_string()
}

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default wait for in-flight scrapes during shutdown (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default root directory of the scraped image tree
pub fn default_image_root() -> String {
    "./img".to_string()
}
