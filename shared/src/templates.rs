//! Template engine for camera url and rules templates.
//!
//! Camera templates are authored by operators, not engineers, so they use a
//! small text-template language (`{{ ... }}`) rather than code. The context
//! handed to a template contains `Now`, `Mountain`, `Camera` and, for rules
//! templates, `Astro`. Instants are exposed as objects with `unix`, calendar
//! fields and `rfc3339`, all in the site's local zone.
//!
//! Rules templates must render to a literal boolean (`true`/`false` and the
//! other forms accepted by [`parse_bool`]); url templates render to the url
//! used verbatim for the download.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tera::Tera;

use crate::astro::{AstroData, Phenom, FULL_MOON, WANING_GIBBOUS, WAXING_GIBBOUS};

/// Render an instant as a template context object.
pub fn time_value(t: &DateTime<Tz>) -> Value {
    json!({
        "unix": t.timestamp(),
        "year": t.year(),
        "month": t.month(),
        "day": t.day(),
        "hour": t.hour(),
        "minute": t.minute(),
        "second": t.second(),
        "rfc3339": t.to_rfc3339(),
    })
}

/// Render astronomical data as a template context object, with transit
/// instants converted into `zone` so comparisons against `Now` line up.
pub fn astro_value(astro: &AstroData, zone: &Tz) -> Value {
    let transits = |table: &HashMap<Phenom, DateTime<chrono::Utc>>| -> Value {
        let map: serde_json::Map<String, Value> = table
            .iter()
            .map(|(phenom, instant)| {
                (
                    format!("{:?}", phenom),
                    time_value(&instant.with_timezone(zone)),
                )
            })
            .collect();
        Value::Object(map)
    };

    json!({
        "sun": transits(&astro.sun_transit),
        "moon": transits(&astro.moon_transit),
        "moon_phase": astro.moon_phase,
    })
}

/// Build a template engine with the helper functions camera templates may use:
/// integer arithmetic (`add`, `sub`, `mul`, `div`, `mod`, `floor`) plus the
/// astronomical predicates `betweenRiseSet` and `brightMoon`.
pub fn engine() -> Tera {
    let mut tera = Tera::default();

    tera.register_function("add", int_pair(|i, j| Ok(i + j)));
    tera.register_function("sub", int_pair(|i, j| Ok(i - j)));
    tera.register_function("mul", int_pair(|i, j| Ok(i * j)));
    tera.register_function("div", int_pair(|i, j| {
        if j == 0 {
            Err(tera::Error::msg("div: division by zero"))
        } else {
            Ok(i / j)
        }
    }));
    tera.register_function("mod", int_pair(|i, j| {
        if j == 0 {
            Err(tera::Error::msg("mod: division by zero"))
        } else {
            Ok(i % j)
        }
    }));
    tera.register_function("floor", int_pair(|i, j| {
        if j == 0 {
            Err(tera::Error::msg("floor: division by zero"))
        } else {
            Ok(i - (i % j))
        }
    }));

    tera.register_function(
        "betweenRiseSet",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let now = unix_field(args, "now")?;
            let offset = int_arg(args, "offset")?;
            let astro = args
                .get("astro")
                .ok_or_else(|| tera::Error::msg("betweenRiseSet: missing `astro` argument"))?;
            let start = sun_unix(astro, Phenom::StartCivilTwilight)? - offset * 3600;
            let end = sun_unix(astro, Phenom::EndCivilTwilight)? + offset * 3600;
            Ok(Value::Bool(now > start && now < end))
        },
    );

    tera.register_function(
        "brightMoon",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let phase = args
                .get("astro")
                .and_then(|astro| astro["moon_phase"].as_str())
                .ok_or_else(|| tera::Error::msg("brightMoon: missing `astro` argument"))?;
            let bright = matches!(phase, FULL_MOON | WAXING_GIBBOUS | WANING_GIBBOUS);
            Ok(Value::Bool(bright))
        },
    );

    tera
}

/// Render a single template with the given context.
pub fn render(name: &str, template: &str, context: &tera::Context) -> crate::Result<String> {
    let mut tera = engine();
    tera.add_raw_template(name, template)
        .map_err(|e| crate::ScrapedError::Template(format!("parsing {} template: {}", name, e)))?;
    tera.render(name, context)
        .map_err(|e| crate::ScrapedError::Template(format!("executing {} template: {}", name, e)).into())
}

/// Parse a literal boolean the way Go's strconv.ParseBool does: accepts
/// `1`, `t`, `T`, `true`, `TRUE`, `True` and their false counterparts.
pub fn parse_bool(s: &str) -> crate::Result<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(crate::ScrapedError::Template(format!(
            "\"{}\" is not a literal boolean",
            other
        ))
        .into()),
    }
}

fn int_pair<F>(op: F) -> impl tera::Function
where
    F: Fn(i64, i64) -> tera::Result<i64> + Send + Sync + 'static,
{
    move |args: &HashMap<String, Value>| -> tera::Result<Value> {
        let i = int_arg(args, "i")?;
        let j = int_arg(args, "j")?;
        op(i, j).map(Value::from)
    }
}

fn int_arg(args: &HashMap<String, Value>, name: &str) -> tera::Result<i64> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| tera::Error::msg(format!("missing integer argument `{}`", name)))
}

/// Unix seconds of a time object argument (as produced by [`time_value`]).
fn unix_field(args: &HashMap<String, Value>, name: &str) -> tera::Result<i64> {
    args.get(name)
        .and_then(|value| value["unix"].as_i64())
        .ok_or_else(|| tera::Error::msg(format!("missing time argument `{}`", name)))
}

fn sun_unix(astro: &Value, phenom: Phenom) -> tera::Result<i64> {
    astro["sun"][format!("{:?}", phenom)]["unix"]
        .as_i64()
        .ok_or_else(|| tera::Error::msg(format!("astro data has no sun {:?} entry", phenom)))
}
