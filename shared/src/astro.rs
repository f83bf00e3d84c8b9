//! Astronomical data for site-days: sun and moon transit times plus moon phase.
//!
//! Two providers are available. [`UsnoProvider`] queries the US Navy's
//! "Astronomical Applications API" (<https://aa.usno.navy.mil/data/docs/api.php>)
//! and returns full sun/moon data. [`LocalProvider`] computes sunrise and
//! sunset locally with the NOAA solar equations and approximates civil
//! twilight as 30 minutes before/after them; it needs no network access but
//! provides no moon data.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveTime, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A discrete sun/moon transit phenomenon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phenom {
    StartCivilTwilight,
    Rise,
    UpperTransit,
    Set,
    EndCivilTwilight,
    LowerTransit,
}

/// Moon phase labels as reported by the USNO api.
pub const NEW_MOON: &str = "New Moon";
pub const WAXING_CRESCENT: &str = "Waxing Crescent";
pub const FIRST_QUARTER: &str = "First Quarter";
pub const WAXING_GIBBOUS: &str = "Waxing Gibbous";
pub const FULL_MOON: &str = "Full Moon";
pub const WANING_GIBBOUS: &str = "Waning Gibbous";
pub const LAST_QUARTER: &str = "Last Quarter";
pub const WANING_CRESCENT: &str = "Waning Crescent";

/// Astronomical information for one site-day.
///
/// Transit instants are stored in UTC; callers convert into the site's zone
/// for display and template evaluation.
#[derive(Debug, Clone)]
pub struct AstroData {
    pub sun_transit: HashMap<Phenom, DateTime<Utc>>,
    pub moon_transit: HashMap<Phenom, DateTime<Utc>>,
    pub moon_phase: String,
    pub date: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

/// Source of astronomical data for a coordinate and local date.
#[async_trait]
pub trait AstroProvider: Send + Sync {
    /// Fetch sun/moon data for the day containing `date`. `date` must carry
    /// the location's time zone or the transit instants will be wrong.
    async fn get(&self, lat: f64, lon: f64, date: DateTime<Tz>) -> crate::Result<AstroData>;
}

const USNO_API_ID: &str = "scraped_v1";

/// Remote provider backed by the USNO "rstt/oneday" endpoint.
pub struct UsnoProvider {
    client: reqwest::Client,
}

impl UsnoProvider {
    pub fn new() -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client for USNO api")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AstroProvider for UsnoProvider {
    async fn get(&self, lat: f64, lon: f64, date: DateTime<Tz>) -> crate::Result<AstroData> {
        let offset_hours = date.offset().fix().local_minus_utc() / 3600;
        let url = format!(
            "https://api.usno.navy.mil/rstt/oneday?date={:02}/{:02}/{}&coords={},{}&tz={}&ID={}",
            date.month(),
            date.day(),
            date.year(),
            lat,
            lon,
            offset_hours,
            USNO_API_ID
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed request to GET {}", url))?;

        if !response.status().is_success() {
            return Err(crate::ScrapedError::Astro(format!(
                "GET {} returned status {}",
                url,
                response.status()
            ))
            .into());
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("failed to parse response body for {}", url))?;

        let mut data = AstroData {
            sun_transit: HashMap::new(),
            moon_transit: HashMap::new(),
            moon_phase: String::new(),
            date: date.with_timezone(&Utc),
            lat,
            lon,
        };
        extract_data(&mut data, &raw, &date);

        Ok(data)
    }
}

/// Pick through the JSON returned from the api request and copy the useful
/// transit and phase info into `data`. Entries that fail to parse are skipped.
fn extract_data(data: &mut AstroData, raw: &serde_json::Value, date: &DateTime<Tz>) {
    let transit = |table: &mut HashMap<Phenom, DateTime<Utc>>, entries: &serde_json::Value| {
        let Some(entries) = entries.as_array() else {
            return;
        };
        for entry in entries {
            let (Some(phen), Some(time)) = (entry["phen"].as_str(), entry["time"].as_str())
            else {
                continue;
            };
            let Some(phenom) = phenom_key(phen) else {
                continue;
            };
            // phenomenon times come as HH:MM in the requested zone
            let Ok(parsed) = NaiveTime::parse_from_str(time, "%H:%M") else {
                debug!(phen, time, "skipping unparseable transit time");
                continue;
            };
            let local = date
                .date_naive()
                .and_time(parsed)
                .and_local_timezone(date.timezone());
            if let LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) = local {
                table.insert(phenom, instant.with_timezone(&Utc));
            }
        }
    };

    transit(&mut data.sun_transit, &raw["sundata"]);
    transit(&mut data.moon_transit, &raw["moondata"]);

    // "curphase" is only present away from the quarter phases; fall back to
    // the closest phase.
    if let Some(phase) = raw["curphase"].as_str() {
        data.moon_phase = phase.to_string();
    } else if let Some(phase) = raw["closestphase"]["phase"].as_str() {
        data.moon_phase = phase.to_string();
    }
}

fn phenom_key(code: &str) -> Option<Phenom> {
    match code {
        "BC" => Some(Phenom::StartCivilTwilight),
        "R" => Some(Phenom::Rise),
        "U" => Some(Phenom::UpperTransit),
        "S" => Some(Phenom::Set),
        "EC" => Some(Phenom::EndCivilTwilight),
        "L" => Some(Phenom::LowerTransit),
        _ => None,
    }
}

/// Offline provider computing sun rise/set with the NOAA solar equations.
/// Civil twilight is about 30 minutes before/after rise/set.
pub struct LocalProvider;

#[async_trait]
impl AstroProvider for LocalProvider {
    async fn get(&self, lat: f64, lon: f64, date: DateTime<Tz>) -> crate::Result<AstroData> {
        let rise = solar_event(true, lat, lon, &date)?;
        let set = solar_event(false, lat, lon, &date)?;

        let mut sun_transit = HashMap::new();
        sun_transit.insert(Phenom::Rise, rise.with_timezone(&Utc));
        sun_transit.insert(Phenom::Set, set.with_timezone(&Utc));
        sun_transit.insert(
            Phenom::StartCivilTwilight,
            (rise - Duration::minutes(30)).with_timezone(&Utc),
        );
        sun_transit.insert(
            Phenom::EndCivilTwilight,
            (set + Duration::minutes(30)).with_timezone(&Utc),
        );

        Ok(AstroData {
            sun_transit,
            moon_transit: HashMap::new(),
            moon_phase: String::new(),
            date: date.with_timezone(&Utc),
            lat,
            lon,
        })
    }
}

// Zenith for "official" sunrise/sunset: 90 degrees 50'.
const ZENITH_COS: f64 = -0.014543897;

/// NOAA sunrise/sunset equation for the day containing `date`. Returns the
/// event instant in the date's zone, or an error in polar day/night when the
/// sun never crosses the horizon.
fn solar_event(rising: bool, lat: f64, lon: f64, date: &DateTime<Tz>) -> crate::Result<DateTime<Tz>> {
    let n = f64::from(date.ordinal());
    let lng_hour = lon / 15.0;

    let t = if rising {
        n + (6.0 - lng_hour) / 24.0
    } else {
        n + (18.0 - lng_hour) / 24.0
    };

    // sun's mean anomaly and true longitude
    let m = 0.9856 * t - 3.289;
    let l = wrap(
        m + 1.916 * m.to_radians().sin() + 0.020 * (2.0 * m).to_radians().sin() + 282.634,
        360.0,
    );

    // right ascension, shifted into the same quadrant as L, in hours
    let mut ra = wrap((0.91764 * l.to_radians().tan()).atan().to_degrees(), 360.0);
    ra += (l / 90.0).floor() * 90.0 - (ra / 90.0).floor() * 90.0;
    ra /= 15.0;

    let sin_dec = 0.39782 * l.to_radians().sin();
    let cos_dec = sin_dec.asin().cos();

    let cos_h = (ZENITH_COS - sin_dec * lat.to_radians().sin())
        / (cos_dec * lat.to_radians().cos());
    if cos_h > 1.0 {
        return Err(crate::ScrapedError::Astro(format!(
            "sun never rises at ({}, {}) on {}",
            lat,
            lon,
            date.date_naive()
        ))
        .into());
    }
    if cos_h < -1.0 {
        return Err(crate::ScrapedError::Astro(format!(
            "sun never sets at ({}, {}) on {}",
            lat,
            lon,
            date.date_naive()
        ))
        .into());
    }

    let h = if rising {
        (360.0 - cos_h.acos().to_degrees()) / 15.0
    } else {
        cos_h.acos().to_degrees() / 15.0
    };

    // local mean time of the event, converted to the site's civil time
    let mean = h + ra - 0.06571 * t - 6.622;
    let ut = wrap(mean - lng_hour, 24.0);
    let offset_hours = f64::from(date.offset().fix().local_minus_utc()) / 3600.0;
    let local_hours = wrap(ut + offset_hours, 24.0);

    let secs = (local_hours * 3600.0).round() as u32;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs.min(86_399), 0)
        .unwrap_or(NaiveTime::MIN);
    match date
        .date_naive()
        .and_time(time)
        .and_local_timezone(date.timezone())
    {
        LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) => Ok(instant),
        LocalResult::None => Err(crate::ScrapedError::Astro(format!(
            "no valid local time for solar event at ({}, {}) on {}",
            lat,
            lon,
            date.date_naive()
        ))
        .into()),
    }
}

fn wrap(value: f64, modulus: f64) -> f64 {
    let wrapped = value % modulus;
    if wrapped < 0.0 {
        wrapped + modulus
    } else {
        wrapped
    }
}
