//! Tests for configuration management implementation

use crate::config::ConfigManager;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::fs;

/// Write a scraped.toml with the given content into the temp config dir.
async fn write_config(temp_dir: &TempDir, content: &str) {
    fs::write(temp_dir.path().join("scraped.toml"), content)
        .await
        .unwrap();
}

fn valid_config() -> &'static str {
    r#"
        database_path = "./data/scraped.db"
        image_root = "./img"
        user_agent = "scraped-test"
        request_timeout_seconds = 30

        [image]
        width = 1024
        height = 768
        quality = 70
        equality_testing = true
        equality_tolerance = 2.0

        [scheduling]
        max_attempts = 3
        wait_time_minutes = 10
    "#
}

#[test]
fn test_missing_config_dir_rejected() {
    let result = ConfigManager::new(PathBuf::from("/nonexistent/config/dir"));
    assert!(result.is_err());
}

#[test]
fn test_config_path_must_be_directory() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("not-a-dir");
    std::fs::write(&file_path, "x").unwrap();
    assert!(ConfigManager::new(file_path).is_err());
}

#[tokio::test]
async fn test_load_valid_config() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, valid_config()).await;

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(!manager.is_loaded());

    manager.load_config().await.unwrap();
    assert!(manager.is_loaded());
    assert!(manager.current_checksum.is_some());

    let config = manager.config.as_ref().unwrap();
    assert_eq!(config.image.width, 1024);
    assert_eq!(config.scheduling.max_attempts, 3);
    assert!(config.image.equality_testing);
}

#[tokio::test]
async fn test_missing_config_file_fails_load() {
    let temp_dir = TempDir::new().unwrap();
    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(manager.load_config().await.is_err());
}

#[tokio::test]
async fn test_toml_syntax_error_fails_load() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, "database_path = unquoted").await;

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(manager.load_config().await.is_err());
    assert!(!manager.is_loaded());
}

#[tokio::test]
async fn test_semantic_validation_fails_load() {
    let temp_dir = TempDir::new().unwrap();
    // parses fine, but quality is out of range
    write_config(
        &temp_dir,
        r#"
            database_path = "./data/scraped.db"

            [image]
            quality = 150
        "#,
    )
    .await;

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(manager.load_config().await.is_err());
}

#[tokio::test]
async fn test_checksum_tracks_content() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, valid_config()).await;

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    manager.load_config().await.unwrap();
    let first = manager.current_checksum.clone().unwrap();

    // same content, same checksum
    manager.load_config().await.unwrap();
    assert_eq!(manager.current_checksum.clone().unwrap(), first);

    // changed content, new checksum
    write_config(&temp_dir, &valid_config().replace("1024", "800")).await;
    manager.load_config().await.unwrap();
    assert_ne!(manager.current_checksum.clone().unwrap(), first);
}
