//! Data model for the scraping daemon: sites, their cameras, and the outcome
//! records of individual scrape attempts.

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::astro::AstroData;
use crate::templates;

/// A mountain (or other scenic location) that owns one or more cameras.
#[derive(Debug, Clone, Serialize)]
pub struct Site {
    /// Primary key in the store
    pub id: i64,
    pub name: String,
    /// Two-letter state/region code
    pub state: String,
    pub elevation_ft: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// IANA time zone location, region/city form (e.g. "America/Denver")
    pub tz_location: String,
    /// Filesystem-safe directory name under the image root
    pub pathname: String,
}

impl Site {
    /// Resolve the site's named time zone location.
    pub fn tz(&self) -> crate::Result<Tz> {
        self.tz_location.parse::<Tz>().map_err(|_| {
            crate::ScrapedError::Config(format!(
                "unknown time zone location \"{}\" for site {}",
                self.tz_location, self.name
            ))
            .into()
        })
    }
}

/// A webcam attached to a site.
#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    /// Primary key in the store
    pub id: i64,
    /// Owning site
    pub site_id: i64,
    pub name: String,
    pub comment: String,
    /// Minutes between scheduled scrapes; hour-aligned multiples
    pub interval_minutes: i64,
    /// Seconds the worker sleeps before fetching, staggering cameras that
    /// share a firing time
    pub delay_seconds: i64,
    /// Filename suffix of saved images (e.g. "jpg")
    pub file_extension: String,
    /// Text template producing the download url
    pub url_template: String,
    /// Text template deciding whether a slot is scraped; must render to a
    /// literal boolean
    pub rules_template: String,
    /// Master on/off switch; inactive cameras are skipped by the planner
    pub active: bool,
    /// Filesystem-safe directory name under the site's directory
    pub pathname: String,
}

impl Camera {
    /// Render the camera's url template for the given local time.
    pub fn execute_url(&self, now: &DateTime<Tz>, site: &Site) -> crate::Result<String> {
        let mut context = tera::Context::new();
        context.insert("Now", &templates::time_value(now));
        context.insert("Mountain", site);
        context.insert("Camera", self);
        templates::render("url", &self.url_template, &context).with_context(|| {
            format!("camera url template (id={}, name={})", self.id, self.name)
        })
    }

    /// Render the camera's rules template for the given local time and parse
    /// the output as a literal boolean. Render errors and non-boolean output
    /// are both errors; callers treat them as planning failures.
    pub fn execute_rules(
        &self,
        astro: &AstroData,
        now: &DateTime<Tz>,
        site: &Site,
    ) -> crate::Result<bool> {
        let mut context = tera::Context::new();
        context.insert("Astro", &templates::astro_value(astro, &now.timezone()));
        context.insert("Now", &templates::time_value(now));
        context.insert("Mountain", site);
        context.insert("Camera", self);
        let output = templates::render("rules", &self.rules_template, &context)
            .with_context(|| {
                format!("camera rules template (id={}, name={})", self.id, self.name)
            })?;
        templates::parse_bool(output.trim()).with_context(|| {
            format!(
                "camera rules template output (id={}, name={})",
                self.id, self.name
            )
        })
    }
}

/// Outcome record of one scrape attempt. Exactly one is persisted per worker
/// invocation, whatever the result.
#[derive(Debug, Clone, PartialEq)]
pub struct Scrape {
    /// Primary key in the store; 0 until inserted
    pub id: i64,
    pub camera_id: i64,
    /// Firing time of the scrape; persisted as UTC seconds
    pub created: DateTime<Utc>,
    /// One of [`SUCCESS`], [`FAILURE`], [`IDLE`]
    pub result: String,
    /// Free-form failure/reason text; empty on success
    pub detail: String,
    /// Leaf name of the saved image; empty unless successful
    pub filename: String,
}

/// Constants for `Scrape::result`.
pub const SUCCESS: &str = "success";
pub const FAILURE: &str = "failure";
pub const IDLE: &str = "idle";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::Phenom;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn test_site() -> Site {
        Site {
            id: 1,
            name: "Mt Hood".to_string(),
            state: "OR".to_string(),
            elevation_ft: 11250,
            latitude: 45.37,
            longitude: -121.70,
            tz_location: "America/Los_Angeles".to_string(),
            pathname: "mt_hood".to_string(),
        }
    }

    fn test_camera(url_template: &str, rules_template: &str) -> Camera {
        Camera {
            id: 7,
            site_id: 1,
            name: "Palmer".to_string(),
            comment: String::new(),
            interval_minutes: 30,
            delay_seconds: 0,
            file_extension: "jpg".to_string(),
            url_template: url_template.to_string(),
            rules_template: rules_template.to_string(),
            active: true,
            pathname: "palmer".to_string(),
        }
    }

    /// Astro data with civil twilight from 06:00 to 20:00 local.
    fn test_astro(tz: Tz) -> AstroData {
        let mut sun_transit = HashMap::new();
        sun_transit.insert(
            Phenom::StartCivilTwilight,
            tz.with_ymd_and_hms(2020, 7, 4, 6, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        );
        sun_transit.insert(
            Phenom::EndCivilTwilight,
            tz.with_ymd_and_hms(2020, 7, 4, 20, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        );
        AstroData {
            sun_transit,
            moon_transit: HashMap::new(),
            moon_phase: String::new(),
            date: tz
                .with_ymd_and_hms(2020, 7, 4, 0, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
            lat: 45.37,
            lon: -121.70,
        }
    }

    #[test]
    fn test_execute_url_substitutes_fields() {
        let site = test_site();
        let camera = test_camera(
            "https://cams.example.com/{{ Mountain.pathname }}/{{ Camera.pathname }}?h={{ Now.hour }}",
            "true",
        );
        let tz: Tz = site.tz().unwrap();
        let now = tz.with_ymd_and_hms(2020, 7, 4, 9, 30, 0).unwrap();
        let url = camera.execute_url(&now, &site).unwrap();
        assert_eq!(url, "https://cams.example.com/mt_hood/palmer?h=9");
    }

    #[test]
    fn test_execute_url_bad_template_errors() {
        let site = test_site();
        let camera = test_camera("https://cams.example.com/{{ unclosed", "true");
        let tz: Tz = site.tz().unwrap();
        let now = tz.with_ymd_and_hms(2020, 7, 4, 9, 30, 0).unwrap();
        assert!(camera.execute_url(&now, &site).is_err());
    }

    #[test]
    fn test_execute_rules_literal_booleans() {
        let site = test_site();
        let tz: Tz = site.tz().unwrap();
        let astro = test_astro(tz);
        let now = tz.with_ymd_and_hms(2020, 7, 4, 12, 0, 0).unwrap();

        let camera = test_camera("u", "true");
        assert!(camera.execute_rules(&astro, &now, &site).unwrap());

        let camera = test_camera("u", "False");
        assert!(!camera.execute_rules(&astro, &now, &site).unwrap());

        // non-boolean output is an error, not false
        let camera = test_camera("u", "maybe");
        assert!(camera.execute_rules(&astro, &now, &site).is_err());
    }

    #[test]
    fn test_between_rise_set_boundaries() {
        let site = test_site();
        let tz: Tz = site.tz().unwrap();
        let astro = test_astro(tz);
        let camera = test_camera("u", "{{ betweenRiseSet(now=Now, astro=Astro, offset=0) }}");

        let cases = [
            (5, 59, false),
            (6, 1, true),
            (19, 59, true),
            (20, 1, false),
        ];
        for (hour, minute, expected) in cases {
            let now = tz.with_ymd_and_hms(2020, 7, 4, hour, minute, 0).unwrap();
            let got = camera.execute_rules(&astro, &now, &site).unwrap();
            assert_eq!(got, expected, "at {:02}:{:02}", hour, minute);
        }
    }

    #[test]
    fn test_rules_missing_astro_entry_errors() {
        let site = test_site();
        let tz: Tz = site.tz().unwrap();
        // astro data without twilight entries, as the local provider yields
        // in polar conditions
        let astro = AstroData {
            sun_transit: HashMap::new(),
            moon_transit: HashMap::new(),
            moon_phase: String::new(),
            date: Utc::now(),
            lat: 0.0,
            lon: 0.0,
        };
        let camera = test_camera("u", "{{ betweenRiseSet(now=Now, astro=Astro, offset=0) }}");
        let now = tz.with_ymd_and_hms(2020, 7, 4, 12, 0, 0).unwrap();
        assert!(camera.execute_rules(&astro, &now, &site).is_err());
    }

    #[test]
    fn test_bad_tz_location() {
        let mut site = test_site();
        site.tz_location = "Mars/Olympus_Mons".to_string();
        assert!(site.tz().is_err());
    }
}
