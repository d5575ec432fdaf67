//! When a job runs next.

use std::fmt;

use chrono::{DateTime, Days, Duration, NaiveTime, Utc};

use crate::config::ScheduleConfig;
use crate::error::{Result, TronError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduler {
    Interval(Duration),
    Daily(NaiveTime),
    Constant,
}

impl Scheduler {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self> {
        match cfg {
            ScheduleConfig::Interval { seconds: 0 } => Err(TronError::InvalidConfig(
                "interval must be at least one second".into(),
            )),
            ScheduleConfig::Interval { seconds } => {
                i64::try_from(*seconds)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .map(Self::Interval)
                    .ok_or_else(|| TronError::InvalidConfig(format!("interval {seconds} too large")))
            }
            ScheduleConfig::Daily { time } => NaiveTime::parse_from_str(time, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
                .map(Self::Daily)
                .map_err(|_| TronError::InvalidConfig(format!("invalid daily time '{time}'"))),
            ScheduleConfig::Constant => Ok(Self::Constant),
        }
    }

    /// The run time following `last`, never earlier than `now`. None when
    /// it falls past the representable calendar.
    pub fn next_run_time(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(interval) => match last {
                Some(last) => last.checked_add_signed(*interval).map(|t| t.max(now)),
                None => Some(now),
            },
            Self::Daily(time) => {
                let base = last.map_or(now, |l| l.max(now));
                let candidate = base.date_naive().and_time(*time).and_utc();
                if candidate > base {
                    Some(candidate)
                } else {
                    candidate.checked_add_days(Days::new(1))
                }
            }
            Self::Constant => Some(now),
        }
    }

    /// A constant scheduler only ever has one run in flight.
    pub fn permits_overlap(&self) -> bool {
        !matches!(self, Self::Constant)
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "interval {}s", d.num_seconds()),
            Self::Daily(t) => write!(f, "daily {}", t.format("%H:%M:%S")),
            Self::Constant => f.write_str("constant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::t0;

    #[test]
    fn interval_follows_last_run() {
        let s = Scheduler::from_config(&ScheduleConfig::Interval { seconds: 300 }).unwrap();
        assert_eq!(s.next_run_time(None, t0()), Some(t0()));
        assert_eq!(
            s.next_run_time(Some(t0()), t0()),
            Some(t0() + Duration::seconds(300))
        );
        // a long-overdue run is not scheduled in the past
        let later = t0() + Duration::hours(2);
        assert_eq!(s.next_run_time(Some(t0()), later), Some(later));
    }

    #[test]
    fn daily_picks_next_occurrence() {
        let s = Scheduler::from_config(&ScheduleConfig::Daily {
            time: "04:00".into(),
        })
        .unwrap();
        let next = s.next_run_time(None, t0()).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-02T04:00:00+00:00");

        let s = Scheduler::from_config(&ScheduleConfig::Daily {
            time: "18:30:00".into(),
        })
        .unwrap();
        let first = s.next_run_time(None, t0()).unwrap();
        assert_eq!(first.to_rfc3339(), "2024-03-01T18:30:00+00:00");
        // the same slot is never produced twice
        assert_eq!(
            s.next_run_time(Some(first), t0()).unwrap().to_rfc3339(),
            "2024-03-02T18:30:00+00:00"
        );
    }

    #[test]
    fn constant_is_now() {
        assert_eq!(
            Scheduler::Constant.next_run_time(Some(t0()), t0()),
            Some(t0())
        );
        assert!(!Scheduler::Constant.permits_overlap());
    }

    #[test]
    fn invalid_configs_rejected() {
        assert!(Scheduler::from_config(&ScheduleConfig::Interval { seconds: 0 }).is_err());
        assert!(Scheduler::from_config(&ScheduleConfig::Daily {
            time: "25:00".into()
        })
        .is_err());
    }

    #[test]
    fn oversized_intervals_are_config_errors() {
        for seconds in [1u64 << 62, u64::MAX] {
            assert!(matches!(
                Scheduler::from_config(&ScheduleConfig::Interval { seconds }),
                Err(TronError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn next_run_past_the_calendar_is_none() {
        // the largest interval chrono accepts still overflows any real date
        let s = Scheduler::Interval(Duration::MAX);
        assert_eq!(s.next_run_time(Some(t0()), t0()), None);

        let s = Scheduler::Daily(NaiveTime::MIN);
        assert_eq!(s.next_run_time(Some(DateTime::<Utc>::MAX_UTC), t0()), None);
    }
}
