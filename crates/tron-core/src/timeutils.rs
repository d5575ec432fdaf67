//! Date arithmetic used in command templates.
//!
//! A spec is one of `shortdate`, `year`, `month`, `day`, `unixtime` or
//! `daynumber`, optionally followed by `+N` / `-N`, or `days_ago(N)`. The
//! unit of `N` follows the spec: days for `shortdate`/`day`/`daynumber`,
//! years, months, and seconds for `unixtime`.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(shortdate|year|month|day|unixtime|daynumber)(?:([+-])(\d+))?$")
            .expect("valid regex")
    })
}

fn days_ago_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^days_ago\((\d+)\)$").expect("valid regex"))
}

/// Evaluate `spec` relative to `base`. `None` if the spec is not date
/// arithmetic at all, or if the result leaves the representable range.
pub fn date_arithmetic(spec: &str, base: DateTime<Utc>) -> Option<String> {
    if let Some(caps) = days_ago_re().captures(spec) {
        let n: i64 = caps[1].parse().ok()?;
        return Some(shift_days(base, n.checked_neg()?)?.format("%Y-%m-%d").to_string());
    }

    let caps = spec_re().captures(spec)?;
    let offset: i64 = match (caps.get(2), caps.get(3)) {
        (Some(sign), Some(n)) => {
            let n: i64 = n.as_str().parse().ok()?;
            if sign.as_str() == "-" {
                -n
            } else {
                n
            }
        }
        _ => 0,
    };

    let value = match &caps[1] {
        "shortdate" => shift_days(base, offset)?.format("%Y-%m-%d").to_string(),
        "day" => shift_days(base, offset)?.format("%d").to_string(),
        "daynumber" => i64::from(base.date_naive().num_days_from_ce())
            .checked_add(offset)?
            .to_string(),
        "year" => i64::from(base.year()).checked_add(offset)?.to_string(),
        "month" => shift_months(base, offset)?.format("%m").to_string(),
        "unixtime" => base.timestamp().checked_add(offset)?.to_string(),
        _ => return None,
    };
    Some(value)
}

fn shift_days(base: DateTime<Utc>, offset: i64) -> Option<DateTime<Utc>> {
    base.checked_add_signed(Duration::try_days(offset)?)
}

fn shift_months(base: DateTime<Utc>, offset: i64) -> Option<DateTime<Utc>> {
    let months = Months::new(u32::try_from(offset.unsigned_abs()).ok()?);
    if offset >= 0 {
        base.checked_add_months(months)
    } else {
        base.checked_sub_months(months)
    }
}
