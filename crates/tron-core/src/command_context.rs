//! Rendering of command templates.
//!
//! `{key}` is looked up in the context values first, then evaluated as date
//! arithmetic against the run time. `{last_success:spec}` evaluates the spec
//! against the last successful run instead. `{{` and `}}` are literal braces.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

use crate::error::{Result, TronError};
use crate::timeutils::date_arithmetic;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\{([^{}]+)\}").expect("valid regex"))
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    values: BTreeMap<String, String>,
    run_time: DateTime<Utc>,
    last_success: Option<DateTime<Utc>>,
}

impl CommandContext {
    pub fn new(run_time: DateTime<Utc>) -> Self {
        Self {
            values: BTreeMap::new(),
            run_time,
            last_success: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_last_success(mut self, last_success: Option<DateTime<Utc>>) -> Self {
        self.last_success = last_success;
        self
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self.values.get(key) {
            return Some(v.clone());
        }
        match key.split_once(':') {
            Some(("last_success", spec)) => {
                date_arithmetic(spec, self.last_success.unwrap_or(self.run_time))
            }
            Some(_) => None,
            None => date_arithmetic(key, self.run_time),
        }
    }

    pub fn render(&self, template: &str) -> Result<String> {
        let mut missing: Option<String> = None;
        let rendered = template_re().replace_all(template, |caps: &Captures| {
            match caps.get(1) {
                None if &caps[0] == "{{" => "{".to_string(),
                None => "}".to_string(),
                Some(key) => {
                    let key = key.as_str().trim();
                    self.lookup(key).unwrap_or_else(|| {
                        missing.get_or_insert_with(|| key.to_string());
                        String::new()
                    })
                }
            }
        });
        match missing {
            Some(key) => match key.strip_prefix("last_success:") {
                Some(spec) => Err(TronError::InvalidDateSpec(spec.to_string())),
                None => Err(TronError::UnresolvedKey {
                    key,
                    command: template.to_string(),
                }),
            },
            None => Ok(rendered.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> CommandContext {
        CommandContext::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
            .with("name", "nightly")
            .with("run_num", 7)
    }

    #[test]
    fn renders_values_and_dates() {
        let out = ctx().render("run {name}.{run_num} for {shortdate-1}").unwrap();
        assert_eq!(out, "run nightly.7 for 2024-02-29");
    }

    #[test]
    fn last_success_uses_its_own_time() {
        let ls = Utc.with_ymd_and_hms(2024, 2, 20, 4, 0, 0).unwrap();
        let c = ctx().with_last_success(Some(ls));
        assert_eq!(c.render("{last_success:days_ago(1)}").unwrap(), "2024-02-19");
        assert_eq!(c.render("{last_success:shortdate}").unwrap(), "2024-02-20");
    }

    #[test]
    fn last_success_defaults_to_run_time() {
        assert_eq!(ctx().render("{last_success:shortdate}").unwrap(), "2024-03-01");
    }

    #[test]
    fn unresolved_key_fails() {
        let err = ctx().render("echo {nope} {name}").unwrap_err();
        assert!(matches!(err, TronError::UnresolvedKey { key, .. } if key == "nope"));
        assert!(ctx().render("{other:shortdate}").is_err());
        assert!(matches!(
            ctx().render("{last_success:fortnight}"),
            Err(TronError::InvalidDateSpec(s)) if s == "fortnight"
        ));
    }

    #[test]
    fn out_of_range_dates_fail_to_render() {
        assert!(matches!(
            ctx().render("echo {days_ago(1000000000000000)}"),
            Err(TronError::UnresolvedKey { key, .. }) if key == "days_ago(1000000000000000)"
        ));
        assert!(matches!(
            ctx().render("{last_success:shortdate+9223372036854775807}"),
            Err(TronError::InvalidDateSpec(_))
        ));
    }

    #[test]
    fn doubled_braces_are_literal() {
        assert_eq!(
            ctx().render("awk '{{print $1}}' {name}").unwrap(),
            "awk '{print $1}' nightly"
        );
    }
}
