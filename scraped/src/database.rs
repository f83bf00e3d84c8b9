//! Database management for the scraping daemon
//!
//! This module handles SQLite access to the three tables the daemon lives
//! on: `site`, `camera` and `scrape`. Sites and cameras are read fresh by
//! every planner and worker invocation (nothing is cached here), and scrape
//! outcome records are write-only from the daemon's perspective.
// All instants are persisted as UTC Unix seconds with sub-second precision
// floored, so records round-trip identically regardless of the site's zone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Camera, Scrape, Site, SUCCESS};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// SQLite store for sites, cameras and scrape records.
/// The `connection` field is an `Option<Connection>` to allow for lazy
/// initialization of the connection.
pub struct ScrapeDatabase {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS site (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    state        TEXT NOT NULL DEFAULT '',
    elevation_ft INTEGER NOT NULL DEFAULT 0,
    latitude     REAL NOT NULL,
    longitude    REAL NOT NULL,
    tz_location  TEXT NOT NULL,
    pathname     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS camera (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id          INTEGER NOT NULL REFERENCES site(id),
    name             TEXT NOT NULL,
    comment          TEXT NOT NULL DEFAULT '',
    interval_minutes INTEGER NOT NULL,
    delay_seconds    INTEGER NOT NULL DEFAULT 0,
    file_extension   TEXT NOT NULL DEFAULT 'jpg',
    url_template     TEXT NOT NULL,
    rules_template   TEXT NOT NULL,
    is_active        INTEGER NOT NULL DEFAULT 1,
    pathname         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scrape (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id INTEGER NOT NULL REFERENCES camera(id),
    created   INTEGER NOT NULL,
    result    TEXT NOT NULL,
    detail    TEXT NOT NULL DEFAULT '',
    filename  TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_scrape_camera_created
    ON scrape(camera_id, created);
";

impl ScrapeDatabase {
    /// Create a new store handle for the given database file. The parent
    /// directory is created if necessary; the file itself is opened lazily.
    pub fn new<P: AsRef<Path>>(db_path: P, busy_timeout_seconds: u64) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Create the tables and indexes if they do not exist. Idempotent, safe
    /// to call on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing scrape database at {}", self.db_path.display());

        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create database schema")?;

        info!("Database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection.
    /// If the connection doesn't exist, it's created with WAL mode and the
    /// configured busy timeout.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode lets readers continue while a writer is writing,
            // which matters once several scrape tasks report concurrently.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// All sites in the store.
    pub async fn sites(&mut self) -> Result<Vec<Site>> {
        let conn = self.get_connection()?;
        let mut statement = conn
            .prepare(
                "SELECT id, name, state, elevation_ft, latitude, longitude, tz_location, pathname
                 FROM site ORDER BY id",
            )
            .context("Failed to prepare site query")?;

        let sites = statement
            .query_map([], site_from_row)
            .context("Failed to query sites")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read site rows")?;

        Ok(sites)
    }

    /// A single site by id.
    pub async fn site(&mut self, id: i64) -> Result<Site> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT id, name, state, elevation_ft, latitude, longitude, tz_location, pathname
             FROM site WHERE id = ?1 LIMIT 1",
            params![id],
            site_from_row,
        )
        .with_context(|| format!("Failed to read site {}", id))
    }

    /// A single camera by id.
    pub async fn camera(&mut self, id: i64) -> Result<Camera> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT id, site_id, name, comment, interval_minutes, delay_seconds,
                    file_extension, url_template, rules_template, is_active, pathname
             FROM camera WHERE id = ?1 LIMIT 1",
            params![id],
            camera_from_row,
        )
        .with_context(|| format!("Failed to read camera {}", id))
    }

    /// All cameras attached to a site, active or not.
    pub async fn cameras_of_site(&mut self, site_id: i64) -> Result<Vec<Camera>> {
        let conn = self.get_connection()?;
        let mut statement = conn
            .prepare(
                "SELECT id, site_id, name, comment, interval_minutes, delay_seconds,
                        file_extension, url_template, rules_template, is_active, pathname
                 FROM camera WHERE site_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare camera query")?;

        let cameras = statement
            .query_map(params![site_id], camera_from_row)
            .with_context(|| format!("Failed to query cameras of site {}", site_id))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read camera rows")?;

        Ok(cameras)
    }

    /// The most recent successful scrape for a camera, if any. Used by the
    /// worker's image equality suppression to locate the previous image.
    pub async fn most_recent_success_scrape(
        &mut self,
        camera_id: i64,
    ) -> Result<Option<Scrape>> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT id, camera_id, created, result, detail, filename
             FROM scrape WHERE camera_id = ?1 AND result = ?2
             ORDER BY created DESC LIMIT 1",
            params![camera_id, SUCCESS],
            scrape_from_row,
        )
        .optional()
        .with_context(|| format!("Failed to read most recent success for camera {}", camera_id))
    }

    /// Scrape records for a camera with `start <= created <= end`, oldest
    /// first.
    pub async fn scrapes(
        &mut self,
        camera_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Scrape>> {
        let conn = self.get_connection()?;
        let mut statement = conn
            .prepare(
                "SELECT id, camera_id, created, result, detail, filename
                 FROM scrape WHERE camera_id = ?1 AND created BETWEEN ?2 AND ?3
                 ORDER BY created ASC",
            )
            .context("Failed to prepare scrape query")?;

        let scrapes = statement
            .query_map(
                params![camera_id, start.timestamp(), end.timestamp()],
                scrape_from_row,
            )
            .with_context(|| format!("Failed to query scrapes of camera {}", camera_id))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read scrape rows")?;

        Ok(scrapes)
    }

    /// Insert a scrape record, flooring `created` to whole UTC seconds, and
    /// backfill the new row id into the record.
    pub async fn insert_scrape(&mut self, scrape: &mut Scrape) -> Result<i64> {
        // the store assigns row ids
        if scrape.id != 0 {
            return Err(anyhow::anyhow!(
                "attempt to insert scrape with an existing id ({})",
                scrape.id
            ));
        }

        debug!(
            camera_id = scrape.camera_id,
            result = %scrape.result,
            "Storing scrape record"
        );

        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO scrape (camera_id, created, result, detail, filename)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scrape.camera_id,
                scrape.created.timestamp(),
                scrape.result,
                scrape.detail,
                scrape.filename,
            ],
        )
        .with_context(|| {
            format!(
                "Failed to insert scrape (camera {}, time {})",
                scrape.camera_id,
                scrape.created.to_rfc3339()
            )
        })?;

        scrape.id = conn.last_insert_rowid();
        Ok(scrape.id)
    }

    /// Insert a site and backfill its row id. Used by seeding and tests; the
    /// daemon itself never writes sites.
    pub async fn insert_site(&mut self, site: &mut Site) -> Result<i64> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO site (name, state, elevation_ft, latitude, longitude, tz_location, pathname)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                site.name,
                site.state,
                site.elevation_ft,
                site.latitude,
                site.longitude,
                site.tz_location,
                site.pathname,
            ],
        )
        .with_context(|| format!("Failed to insert site {}", site.name))?;

        site.id = conn.last_insert_rowid();
        Ok(site.id)
    }

    /// Insert a camera and backfill its row id. Used by seeding and tests.
    pub async fn insert_camera(&mut self, camera: &mut Camera) -> Result<i64> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO camera (site_id, name, comment, interval_minutes, delay_seconds,
                                 file_extension, url_template, rules_template, is_active, pathname)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                camera.site_id,
                camera.name,
                camera.comment,
                camera.interval_minutes,
                camera.delay_seconds,
                camera.file_extension,
                camera.url_template,
                camera.rules_template,
                camera.active,
                camera.pathname,
            ],
        )
        .with_context(|| format!("Failed to insert camera {}", camera.name))?;

        camera.id = conn.last_insert_rowid();
        Ok(camera.id)
    }
}

fn site_from_row(row: &Row) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        state: row.get(2)?,
        elevation_ft: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        tz_location: row.get(6)?,
        pathname: row.get(7)?,
    })
}

fn camera_from_row(row: &Row) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: row.get(0)?,
        site_id: row.get(1)?,
        name: row.get(2)?,
        comment: row.get(3)?,
        interval_minutes: row.get(4)?,
        delay_seconds: row.get(5)?,
        file_extension: row.get(6)?,
        url_template: row.get(7)?,
        rules_template: row.get(8)?,
        active: row.get(9)?,
        pathname: row.get(10)?,
    })
}

fn scrape_from_row(row: &Row) -> rusqlite::Result<Scrape> {
    let created: i64 = row.get(2)?;
    Ok(Scrape {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        created: utc_seconds(created)?,
        result: row.get(3)?,
        detail: row.get(4)?,
        filename: row.get(5)?,
    })
}

fn utc_seconds(seconds: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            format!("timestamp {} out of range", seconds).into(),
        )
    })
}
