//! Tests for the site/camera/scrape store

use crate::database::ScrapeDatabase;
use chrono::{Duration, TimeZone, Utc};
use shared::model::{self, Camera, Scrape, Site};
use tempfile::TempDir;

fn test_site() -> Site {
    Site {
        id: 0,
        name: "Mt Hood".to_string(),
        state: "OR".to_string(),
        elevation_ft: 11250,
        latitude: 45.37,
        longitude: -121.70,
        tz_location: "America/Los_Angeles".to_string(),
        pathname: "mt_hood".to_string(),
    }
}

fn test_camera(site_id: i64) -> Camera {
    Camera {
        id: 0,
        site_id,
        name: "Palmer".to_string(),
        comment: "south face".to_string(),
        interval_minutes: 30,
        delay_seconds: 5,
        file_extension: "jpg".to_string(),
        url_template: "https://cams.example.com/palmer.jpg".to_string(),
        rules_template: "{{ betweenRiseSet(now=Now, astro=Astro, offset=0) }}".to_string(),
        active: true,
        pathname: "palmer".to_string(),
    }
}

async fn open_db(temp_dir: &TempDir) -> ScrapeDatabase {
    let mut db = ScrapeDatabase::new(temp_dir.path().join("scraped.db"), 5).unwrap();
    db.initialize().await.unwrap();
    db
}

#[tokio::test]
async fn test_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = ScrapeDatabase::new(temp_dir.path().join("scraped.db"), 5).unwrap();

    let result = db.initialize().await;
    assert!(result.is_ok());

    // Verify that the database file was actually created on disk.
    assert!(temp_dir.path().join("scraped.db").exists());
}

#[tokio::test]
async fn test_site_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let mut site = test_site();
    let id = db.insert_site(&mut site).await.unwrap();
    assert!(id > 0);
    assert_eq!(site.id, id);

    let read_back = db.site(id).await.unwrap();
    assert_eq!(read_back.name, "Mt Hood");
    assert_eq!(read_back.tz_location, "America/Los_Angeles");
    assert_eq!(read_back.pathname, "mt_hood");

    let all = db.sites().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_missing_site_errors() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;
    assert!(db.site(42).await.is_err());
}

#[tokio::test]
async fn test_cameras_of_site() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let mut site = test_site();
    db.insert_site(&mut site).await.unwrap();

    let mut first = test_camera(site.id);
    db.insert_camera(&mut first).await.unwrap();
    let mut second = test_camera(site.id);
    second.name = "Timberline".to_string();
    second.active = false;
    db.insert_camera(&mut second).await.unwrap();

    let cameras = db.cameras_of_site(site.id).await.unwrap();
    assert_eq!(cameras.len(), 2);
    assert_eq!(cameras[0].name, "Palmer");
    assert!(cameras[0].active);
    assert!(!cameras[1].active);
    assert_eq!(cameras[1].delay_seconds, 5);

    // a site with no cameras yields an empty list, not an error
    assert!(db.cameras_of_site(999).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_insert_scrape_floors_to_seconds() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let mut site = test_site();
    db.insert_site(&mut site).await.unwrap();
    let mut camera = test_camera(site.id);
    db.insert_camera(&mut camera).await.unwrap();

    // sub-second precision must not survive persistence
    let created = Utc.timestamp_opt(1_600_000_000, 987_654_321).unwrap();
    let mut scrape = Scrape {
        id: 0,
        camera_id: camera.id,
        created,
        result: model::SUCCESS.to_string(),
        detail: String::new(),
        filename: "1600000000.jpg".to_string(),
    };
    db.insert_scrape(&mut scrape).await.unwrap();
    assert!(scrape.id > 0);

    let read_back = db
        .most_recent_success_scrape(camera.id)
        .await
        .unwrap()
        .expect("scrape should be found");
    assert_eq!(read_back.created, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
    assert_eq!(read_back.filename, "1600000000.jpg");
}

#[tokio::test]
async fn test_insert_scrape_rejects_existing_id() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let mut scrape = Scrape {
        id: 17,
        camera_id: 1,
        created: Utc::now(),
        result: model::FAILURE.to_string(),
        detail: String::new(),
        filename: String::new(),
    };
    assert!(db.insert_scrape(&mut scrape).await.is_err());
}

#[tokio::test]
async fn test_most_recent_success_scrape_skips_failures() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let mut site = test_site();
    db.insert_site(&mut site).await.unwrap();
    let mut camera = test_camera(site.id);
    db.insert_camera(&mut camera).await.unwrap();

    // nothing recorded yet
    assert!(db
        .most_recent_success_scrape(camera.id)
        .await
        .unwrap()
        .is_none());

    let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
    let records = [
        (base, model::SUCCESS, "a.jpg"),
        (base + Duration::minutes(30), model::SUCCESS, "b.jpg"),
        (base + Duration::minutes(60), model::FAILURE, ""),
    ];
    for (created, result, filename) in records {
        let mut scrape = Scrape {
            id: 0,
            camera_id: camera.id,
            created,
            result: result.to_string(),
            detail: String::new(),
            filename: filename.to_string(),
        };
        db.insert_scrape(&mut scrape).await.unwrap();
    }

    // the later failure must not shadow the most recent success
    let most_recent = db
        .most_recent_success_scrape(camera.id)
        .await
        .unwrap()
        .expect("success should be found");
    assert_eq!(most_recent.filename, "b.jpg");
}

#[tokio::test]
async fn test_scrapes_range_query() {
    let temp_dir = TempDir::new().unwrap();
    let mut db = open_db(&temp_dir).await;

    let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
    for offset in [0, 30, 60, 90] {
        let mut scrape = Scrape {
            id: 0,
            camera_id: 1,
            created: base + Duration::minutes(offset),
            result: model::FAILURE.to_string(),
            detail: "trouble downloading image".to_string(),
            filename: String::new(),
        };
        db.insert_scrape(&mut scrape).await.unwrap();
    }

    let in_range = db
        .scrapes(1, base + Duration::minutes(15), base + Duration::minutes(60))
        .await
        .unwrap();
    assert_eq!(in_range.len(), 2);
    assert!(in_range[0].created < in_range[1].created);
    assert_eq!(in_range[0].detail, "trouble downloading image");
}
