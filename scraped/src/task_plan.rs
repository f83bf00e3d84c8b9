//! The day planner: the recurring task that populates a local day of scrape
//! tasks for a single site, then re-enqueues itself for the next local
//! midnight.
//!
//! Planning walks each active camera's interval slots from "now" to the end
//! of the site's local day, evaluates the camera's rules template per slot,
//! and enqueues a scrape task for every slot the rules accept. Failures are
//! retried a bounded number of times within the day; once retries are
//! exhausted the planner defers itself to the next day. A site is never
//! abandoned.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, LocalResult, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use shared::astro::{AstroData, AstroProvider};
use shared::model::Site;

use crate::scheduler::Task;
use crate::task_scrape::scrape_task;
use crate::App;

/// Bounded retry for the astronomical data fetch.
const ASTRO_MAX_TRIES: u32 = 5;
const ASTRO_RETRY_PAUSE: StdDuration = StdDuration::from_secs(1);

/// Create a scheduler task that plans a day of scrapes for `site_id` when
/// fired. `attempt` counts same-day retries, starting at 0.
pub fn plan_task(site_id: i64, attempt: u32, app: Arc<App>, when: DateTime<Utc>) -> Task {
    Task::new(when, move |fired| {
        Box::pin(run_plan(site_id, attempt, app, fired))
    })
}

/// Plan one site's day and arrange the follow-up: a retry on failure, the
/// next-day planner otherwise (enqueued by [`plan_day`] itself).
pub async fn run_plan(site_id: i64, attempt: u32, app: Arc<App>, fired: DateTime<Utc>) {
    match plan_day(&app, site_id, fired).await {
        Ok(scheduled) => {
            info!(site_id, scheduled, "planned day of scrapes");
        }
        Err(err) => {
            error!(site_id, attempt, error = %format!("{:#}", err), "day planning failed");

            let scheduling = &app.config.scheduling;
            if attempt < scheduling.max_attempts {
                let next = fired + Duration::minutes(scheduling.wait_time_minutes);
                warn!(site_id, attempt = attempt + 1, retry_at = %next, "retrying day planning");
                app.scheduler
                    .add(plan_task(site_id, attempt + 1, Arc::clone(&app), next));
            } else {
                let next = next_day_fallback(&app, site_id, fired).await;
                warn!(site_id, next = %next, "too many planning attempts, deferring to next day");
                app.scheduler
                    .add(plan_task(site_id, 0, Arc::clone(&app), next));
            }
        }
    }
}

/// Walk the site's local day and enqueue a scrape task per accepted slot,
/// finishing with the next-day planner. Returns how many scrapes were
/// enqueued.
async fn plan_day(app: &Arc<App>, site_id: i64, fired: DateTime<Utc>) -> anyhow::Result<usize> {
    // read site and cameras fresh; nothing is cached between plans
    let (site, cameras) = {
        let mut db = app.database.lock().await;
        let site = db.site(site_id).await.context("reading site")?;
        let cameras = db
            .cameras_of_site(site_id)
            .await
            .context("reading cameras")?;
        (site, cameras)
    };

    let tz = site.tz()?;
    let now = fired.with_timezone(&tz);
    debug!(site = %site.name, now = %now.to_rfc3339(), "planning site");

    let astro = fetch_astro(app.astro.as_ref(), &site, now).await?;

    let stop = start_of_next_local_day(now);
    let mut scheduled = 0usize;
    for camera in &cameras {
        if !camera.active {
            info!(site = %site.name, camera = %camera.name, "skipping inactive camera");
            continue;
        }

        let interval = Duration::minutes(camera.interval_minutes.max(1));
        let mut slot = round_up(now, interval);
        let mut hits = 0usize;
        while slot < stop {
            let due = camera
                .execute_rules(&astro, &slot, &site)
                .with_context(|| format!("evaluating rules of camera {}", camera.name))?;
            if due {
                app.scheduler.add(scrape_task(
                    site_id,
                    camera.id,
                    Arc::clone(app),
                    slot.with_timezone(&Utc),
                ));
                hits += 1;
            }
            slot = slot + interval;
        }
        debug!(camera = %camera.name, hits, "walked camera slots");
        scheduled += hits;
    }

    // re-seed planning for tomorrow
    let next = start_of_next_local_day(now);
    info!(site = %site.name, next = %next.to_rfc3339(), "scheduled next day planning");
    app.scheduler
        .add(plan_task(site_id, 0, Arc::clone(app), next.with_timezone(&Utc)));

    Ok(scheduled)
}

/// Fetch astronomical data with bounded retry: up to 5 attempts separated by
/// 1-second pauses.
async fn fetch_astro(
    provider: &dyn AstroProvider,
    site: &Site,
    now: DateTime<Tz>,
) -> anyhow::Result<AstroData> {
    let mut last_error = None;
    for attempt in 1..=ASTRO_MAX_TRIES {
        match provider.get(site.latitude, site.longitude, now).await {
            Ok(data) => {
                info!(site = %site.name, attempt, "got astro data");
                return Ok(data);
            }
            Err(err) => {
                debug!(site = %site.name, attempt, error = %format!("{:#}", err), "astro fetch failed");
                last_error = Some(err);
            }
        }
        if attempt < ASTRO_MAX_TRIES {
            tokio::time::sleep(ASTRO_RETRY_PAUSE).await;
        }
    }

    let err = last_error.unwrap_or_else(|| anyhow::anyhow!("astro data unavailable"));
    Err(err.context(format!("no astro data after {} attempts", ASTRO_MAX_TRIES)))
}

/// Next-day firing time for a deferred planner. Planning may have failed
/// because the site's zone itself is unreadable, in which case the next UTC
/// day stands in.
async fn next_day_fallback(app: &Arc<App>, site_id: i64, fired: DateTime<Utc>) -> DateTime<Utc> {
    let tz = {
        let mut db = app.database.lock().await;
        db.site(site_id).await.ok().and_then(|site| site.tz().ok())
    };
    match tz {
        Some(tz) => start_of_next_local_day(fired.with_timezone(&tz)).with_timezone(&Utc),
        None => {
            warn!(site_id, "site zone unavailable, deferring planner to next UTC day");
            start_of_next_local_day(fired.with_timezone(&Tz::UTC)).with_timezone(&Utc)
        }
    }
}

/// Round `t` up to the smallest time >= `t` that is a multiple of `interval`
/// aligned to the hour. Already-aligned times are returned unchanged. Works
/// best for intervals dividing 60 minutes.
pub fn round_up(t: DateTime<Tz>, interval: Duration) -> DateTime<Tz> {
    let interval_seconds = interval.num_seconds().max(1);
    let into_hour = i64::from(t.minute()) * 60 + i64::from(t.second());
    let nanos = i64::from(t.nanosecond());
    let remainder = into_hour % interval_seconds;
    if remainder == 0 && nanos == 0 {
        return t;
    }
    t - Duration::seconds(remainder) - Duration::nanoseconds(nanos)
        + Duration::seconds(interval_seconds)
}

/// The day after `t` at 00:00:00 in the same zone. When midnight is skipped
/// or doubled by a DST transition, the first representable time of the day
/// is used.
pub fn start_of_next_local_day(t: DateTime<Tz>) -> DateTime<Tz> {
    let tz = t.timezone();
    let next = t.date_naive() + Duration::days(1);
    for hour in 0..24 {
        let Some(candidate) = next.and_hms_opt(hour, 0, 0) else {
            continue;
        };
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(instant) => return instant,
            LocalResult::Ambiguous(instant, _) => return instant,
            LocalResult::None => continue,
        }
    }
    // unreachable for real zones
    t + Duration::days(1)
}
