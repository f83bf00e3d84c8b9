//! The scrape worker: one attempt to download, process and archive a
//! camera's current image.
//!
//! A scrape reads the site and camera fresh from the store, renders the
//! camera's url template for the firing time in the site's zone, downloads
//! and decodes the image, resizes it if it exceeds the configured bounds,
//! optionally suppresses it when it is visually identical to the previous
//! successful scrape, writes it to the image tree, and records the outcome.
//!
//! Whatever happens, exactly one scrape record is persisted per invocation.
//! The single exception is a failure to create the image directory, where
//! there is no point recording a failure that would repeat every interval
//! until an operator fixes the filesystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use palette::color_difference::EuclideanDistance;
use palette::{IntoColor, Lab, Srgb};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use tracing::{debug, error, info};

use shared::config::ScrapedConfig;
use shared::model::{self, Scrape};

use crate::scheduler::Task;
use crate::App;

/// Detail sentinels recorded on failed scrapes. Callers of the store
/// distinguish failure causes through these strings, so they are stable.
pub const DETAIL_STORE: &str = "could not read store";
pub const DETAIL_TIME_ZONE: &str = "could not resolve site time zone";
pub const DETAIL_URL_TEMPLATE: &str = "could not execute url template";
pub const DETAIL_DOWNLOAD: &str = "trouble downloading image";
pub const DETAIL_DECODE: &str = "could not decode downloaded image";
pub const DETAIL_IDENTICAL: &str = "image identical to previously scraped image";
pub const DETAIL_SAVE: &str = "could not save image";

/// Create a scheduler task that scrapes `camera_id` of `site_id` when fired.
pub fn scrape_task(site_id: i64, camera_id: i64, app: Arc<App>, when: DateTime<Utc>) -> Task {
    Task::new(when, move |fired| {
        Box::pin(run_scrape(site_id, camera_id, app, fired))
    })
}

/// Execute one scrape attempt and persist its outcome record.
pub async fn run_scrape(site_id: i64, camera_id: i64, app: Arc<App>, fired: DateTime<Utc>) {
    let mut scrape = Scrape {
        id: 0,
        camera_id,
        created: fired,
        result: model::FAILURE.to_string(),
        detail: String::new(),
        filename: String::new(),
    };

    let persist = scrape_once(&app, site_id, &mut scrape, fired).await;
    if !persist {
        return;
    }

    let mut db = app.database.lock().await;
    if let Err(err) = db.insert_scrape(&mut scrape).await {
        // nothing more can be done; the attempt leaves no trace
        error!(
            site_id,
            camera_id,
            error = %format!("{:#}", err),
            "failed to insert scrape record"
        );
    }
}

/// The scrape body. Fills in `scrape` and returns whether the record should
/// be persisted.
async fn scrape_once(
    app: &App,
    site_id: i64,
    scrape: &mut Scrape,
    fired: DateTime<Utc>,
) -> bool {
    let camera_id = scrape.camera_id;

    // read site and camera fresh; configuration may have changed since the
    // planner enqueued this task
    let (site, camera) = {
        let mut db = app.database.lock().await;
        let site = db.site(site_id).await;
        let camera = db.camera(camera_id).await;
        match (site, camera) {
            (Ok(site), Ok(camera)) => (site, camera),
            (Err(err), _) | (_, Err(err)) => {
                scrape.detail = DETAIL_STORE.to_string();
                error!(site_id, camera_id, error = %format!("{:#}", err), "could not read store");
                return true;
            }
        }
    };

    // stagger cameras that share a firing time on the same source
    if camera.delay_seconds > 0 {
        tokio::time::sleep(Duration::from_secs(camera.delay_seconds as u64)).await;
    }

    let tz = match site.tz() {
        Ok(tz) => tz,
        Err(err) => {
            scrape.detail = DETAIL_TIME_ZONE.to_string();
            error!(site_id, camera_id, error = %format!("{:#}", err), "could not resolve site time zone");
            return true;
        }
    };
    let local_now = fired.with_timezone(&tz);

    // the url template sees the local time of the site
    let url = match camera.execute_url(&local_now, &site) {
        Ok(url) => url,
        Err(err) => {
            scrape.detail = DETAIL_URL_TEMPLATE.to_string();
            error!(site_id, camera_id, error = %format!("{:#}", err), "could not execute url template");
            return true;
        }
    };
    if let Err(err) = url::Url::parse(&url) {
        scrape.detail = DETAIL_URL_TEMPLATE.to_string();
        error!(site_id, camera_id, url = %url, error = %err, "could not execute url template");
        return true;
    }

    let body = match download_image(&app.config, &app.client, &url).await {
        Ok(body) => body,
        Err(err) => {
            scrape.detail = DETAIL_DOWNLOAD.to_string();
            error!(site_id, camera_id, url = %url, error = %format!("{:#}", err), "trouble downloading image");
            return true;
        }
    };

    let downloaded = match image::load_from_memory(&body) {
        Ok(image) => image,
        Err(err) => {
            scrape.detail = DETAIL_DECODE.to_string();
            error!(site_id, camera_id, url = %url, error = %err, "could not decode downloaded image");
            return true;
        }
    };

    let processed = resize_to_fit(downloaded, app.config.image.width, app.config.image.height);

    let dir = Path::new(&app.config.image_root)
        .join(&site.pathname)
        .join(&camera.pathname);
    if let Err(err) = ensure_image_dir(&dir) {
        error!(
            site_id,
            camera_id,
            dir = %dir.display(),
            error = %err,
            "could not create image directory"
        );
        return false;
    }

    if app.config.image.equality_testing {
        let previous = previous_image(app, camera_id, &dir).await;
        let candidate = codec_roundtrip(&processed, app.config.image.quality);
        if let (Some(previous), Some(candidate)) = (previous, candidate) {
            if images_equal(&previous, &candidate, app.config.image.equality_tolerance) {
                scrape.detail = DETAIL_IDENTICAL.to_string();
                info!(site_id, camera_id, "image identical to previously scraped image");
                return true;
            }
        }
    }

    scrape.filename = image_filename(fired, &camera.file_extension);
    let image_path = dir.join(&scrape.filename);
    if let Err(err) = save_image(&processed, &image_path, app.config.image.quality) {
        error!(
            site_id,
            camera_id,
            path = %image_path.display(),
            error = %format!("{:#}", err),
            "could not save image"
        );
        scrape.detail = DETAIL_SAVE.to_string();
        scrape.filename.clear();
        return true;
    }
    info!(site_id, camera_id, path = %image_path.display(), "wrote image");

    scrape.result = model::SUCCESS.to_string();
    scrape.detail.clear();
    true
}

/// Download the image with the configured timeout and user agent. Transport
/// errors, non-2xx statuses and non-image content types are all errors.
/// The client is shared across scrapes; the timeout applies per-request.
async fn download_image(
    config: &ScrapedConfig,
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<Vec<u8>> {
    use anyhow::Context;

    let response = client
        .get(url)
        .timeout(Duration::from_secs(config.request_timeout_seconds))
        .header(USER_AGENT, &config.user_agent)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("GET {} returned status {}", url, status);
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("image/") {
        anyhow::bail!(
            "GET {} returned content type \"{}\", not an image",
            url,
            content_type
        );
    }

    let body = response
        .bytes()
        .await
        .with_context(|| format!("reading body of {}", url))?;
    Ok(body.to_vec())
}

/// Shrink the image to fit within `max_width` x `max_height`, preserving
/// aspect ratio. Images already within bounds pass through untouched.
pub fn resize_to_fit(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let target_width = width.min(max_width);
    let target_height = height.min(max_height);
    if width > target_width || height > target_height {
        image.resize(target_width, target_height, FilterType::Lanczos3)
    } else {
        image
    }
}

/// Create the camera's image directory (and parents) with mode 0755.
fn ensure_image_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}

/// The image of the camera's most recent successful scrape, or `None` when
/// it cannot be produced. A missing or unreadable previous image disables
/// suppression for this scrape rather than suppressing a legitimate capture,
/// so the cause is only logged.
async fn previous_image(app: &App, camera_id: i64, dir: &Path) -> Option<DynamicImage> {
    let previous = {
        let mut db = app.database.lock().await;
        db.most_recent_success_scrape(camera_id).await
    };
    let previous = match previous {
        Ok(Some(previous)) => previous,
        Ok(None) => {
            debug!(camera_id, "no previous successful scrape, skipping equality test");
            return None;
        }
        Err(err) => {
            error!(
                camera_id,
                error = %format!("{:#}", err),
                "could not read previous scrape, equality test disabled for this scrape"
            );
            return None;
        }
    };

    let path = dir.join(&previous.filename);
    match image::open(&path) {
        Ok(image) => Some(image),
        Err(err) => {
            error!(
                camera_id,
                path = %path.display(),
                error = %err,
                "could not open previous image, equality test disabled for this scrape"
            );
            None
        }
    }
}

/// Round-trip the image through the JPEG codec at the configured quality.
/// The codec's lossy pass alters pixels beyond resizing, so equality must
/// compare two post-codec images; without this, a freshly downloaded image
/// never matches the one read back from disk.
pub fn codec_roundtrip(image: &DynamicImage, quality: u8) -> Option<DynamicImage> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    if let Err(err) = DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder) {
        error!(error = %err, "in-memory jpeg encode of downloaded image failed");
        return None;
    }
    match image::load_from_memory(&buffer) {
        Ok(image) => Some(image),
        Err(err) => {
            error!(error = %err, "decode of re-encoded downloaded image failed");
            None
        }
    }
}

/// Perceptual image equality: same dimensions and every pixel within
/// `tolerance` delta-E in CIELAB space.
pub fn images_equal(a: &DynamicImage, b: &DynamicImage, tolerance: f64) -> bool {
    if a.dimensions() != b.dimensions() {
        debug!("images have different dimensions");
        return false;
    }

    let a = a.to_rgb8();
    let b = b.to_rgb8();
    let threshold = tolerance * tolerance;
    for (pixel_a, pixel_b) in a.pixels().zip(b.pixels()) {
        let lab_a: Lab = Srgb::new(pixel_a[0], pixel_a[1], pixel_a[2])
            .into_format::<f32>()
            .into_color();
        let lab_b: Lab = Srgb::new(pixel_b[0], pixel_b[1], pixel_b[2])
            .into_format::<f32>()
            .into_color();
        // compare squared distances to skip the sqrt per pixel
        if f64::from(lab_a.distance_squared(lab_b)) > threshold {
            return false;
        }
    }

    true
}

/// Leaf name of a scraped image: lowercase Unix seconds (UTC) plus the
/// camera's extension.
pub fn image_filename(when: DateTime<Utc>, extension: &str) -> String {
    format!("{}.{}", when.timestamp(), extension).to_lowercase()
}

/// Encode the image to disk. JPEG output honors the quality setting; other
/// extensions are encoded by format inferred from the path.
fn save_image(image: &DynamicImage, path: &Path, quality: u8) -> anyhow::Result<()> {
    use anyhow::Context;

    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(encoder)
                .with_context(|| format!("encoding {}", path.display()))?;
        }
        _ => {
            image
                .save(path)
                .with_context(|| format!("saving {}", path.display()))?;
        }
    }
    Ok(())
}
