//! Utility functions for the scraping daemon
//!
//! Hashing helpers used across the daemon components.

use blake3::Hasher;

/// Calculate BLAKE3 checksum of configuration content
///
/// Returns the hash as a hex-encoded string (64 characters). Used to detect
/// configuration changes without re-parsing the file.
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}
