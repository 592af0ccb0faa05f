//! Cron schedules for module callbacks
//!
//! Two forms are accepted:
//!
//! - Standard 5-field expressions (`*/5 * * * *`) and descriptors such as
//!   `@hourly` or `@daily`, evaluated in UTC.
//! - `@every <duration>`, where the duration uses Go-style units
//!   (`1h30m`, `45s`, `500ms`). Intervals are rounded up to one second.

use chrono::{DateTime, Utc};
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Identifies a scheduler entry
pub type EntryId = u64;

/// A parsed cron spec
pub(crate) enum Schedule {
    Every(Duration),
    Cron(Box<croner::Cron>),
}

/// Indicates that a cron spec could not be parsed
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub(crate) struct InvalidSchedule(String);

/// Observability for a single scheduled entry
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronInfo {
    /// The module the entry belongs to.
    pub plugin: String,

    /// The cron spec.
    pub spec: String,

    /// The scheduler's identifier for the entry.
    pub entry: EntryId,

    /// Whether an invocation is currently executing.
    pub running: bool,
}

/// A scheduled `(module, spec)` pair
#[derive(Debug)]
pub(crate) struct CronEntry {
    pub(crate) id: EntryId,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) task: tokio::task::JoinHandle<()>,
}

// === impl Schedule ===

impl Schedule {
    const EVERY: &'static str = "@every";
    const MIN_INTERVAL: Duration = Duration::from_secs(1);

    /// Returns how long to wait from `now` until the next activation
    pub(crate) fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::Cron(cron) => {
                let next = cron.find_next_occurrence(&now, false).ok()?;
                Some((next - now).to_std().unwrap_or_default())
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = InvalidSchedule;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if let Some(interval) = spec.strip_prefix(Self::EVERY) {
            if !interval.starts_with(char::is_whitespace) {
                return Err(InvalidSchedule(format!("unknown descriptor {spec:?}")));
            }
            let interval = crate::duration::parse(interval.trim())
                .map_err(|error| InvalidSchedule(error.to_string()))?;
            return Ok(Schedule::Every(interval.max(Self::MIN_INTERVAL)));
        }

        if !spec.starts_with('@') {
            let fields = spec.split_whitespace().count();
            if fields != 5 {
                return Err(InvalidSchedule(format!(
                    "expected 5 fields, found {fields}"
                )));
            }
        }

        let cron = croner::Cron::new(spec)
            .parse()
            .map_err(|error| InvalidSchedule(error.to_string()))?;
        Ok(Schedule::Cron(Box::new(cron)))
    }
}

// === impl CronEntry ===

impl CronEntry {
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CronEntry {
    fn drop(&mut self) {
        // Stops future activations. An invocation that is already executing
        // runs on its own task and is not interrupted.
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every() {
        let every = |s: &str| match s.parse::<Schedule>().expect("must parse") {
            Schedule::Every(d) => d,
            Schedule::Cron(_) => panic!("expected @every"),
        };
        assert_eq!(every("@every 1m"), Duration::from_secs(60));
        assert_eq!(every("@every 1h30m"), Duration::from_secs(90 * 60));
        assert_eq!(every(" @every 45s "), Duration::from_secs(45));
        // Sub-second intervals are rounded up.
        assert_eq!(every("@every 250ms"), Duration::from_secs(1));
    }

    #[test]
    fn parses_standard_expressions() {
        for spec in ["*/5 * * * *", "0 0 * * 0", "30 2 1 * *", "@hourly", "@daily"] {
            assert!(
                matches!(spec.parse::<Schedule>(), Ok(Schedule::Cron(_))),
                "{spec} must parse"
            );
        }
    }

    #[test]
    fn rejects_invalid_specs() {
        for spec in [
            "",
            "* * * *",
            "0 * * * * *",
            "61 * * * *",
            "@every",
            "@every 0s",
            "@every 5x",
            "@every m",
            "@everyday",
            "not a cron",
        ] {
            assert!(spec.parse::<Schedule>().is_err(), "{spec:?} must not parse");
        }
    }

    #[test]
    fn next_delay() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:07:30Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        let every: Schedule = "@every 90s".parse().expect("must parse");
        assert_eq!(every.next_delay(now), Some(Duration::from_secs(90)));

        let quarter: Schedule = "*/15 * * * *".parse().expect("must parse");
        assert_eq!(
            quarter.next_delay(now),
            Some(Duration::from_secs(7 * 60 + 30))
        );
    }
}
