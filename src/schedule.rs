// Schedule parsing, classification and next-fire-date calculation
//
// Cron expressions are delegated to the `cron` crate; calendar recurrence is
// handled by `RecurrenceRule`. Everything is evaluated in the schedule's
// timezone and converted back to UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use crate::errors::ScheduleError;
use crate::rule::RecurrenceRule;

/// What to run a job on: a cron expression, a fixed instant, a calendar
/// recurrence rule, or any of those bounded by a start/end window.
///
/// String inputs resolve through [`Schedule::parse`], which tries a cron
/// expression first and falls back to an RFC 3339 timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Schedule {
    /// Cron expression, evaluated in `tz` (UTC when unset).
    Cron {
        expression: String,
        tz: Option<Tz>,
    },
    /// One-shot firing at a fixed instant.
    At(DateTime<Utc>),
    /// Calendar recurrence rule.
    Recurrence(RecurrenceRule),
    /// A schedule restricted to the `[start, end]` window, with an optional
    /// timezone applied to the inner schedule when it has none of its own.
    Bounded {
        base: Box<Schedule>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        tz: Option<Tz>,
    },
}

impl Schedule {
    /// Parse a textual schedule: a cron expression if it parses as one,
    /// otherwise an RFC 3339 timestamp for a one-shot firing.
    pub fn parse(input: &str) -> Result<Schedule, ScheduleError> {
        if CronSchedule::from_str(input).is_ok() {
            return Ok(Schedule::Cron {
                expression: input.to_string(),
                tz: None,
            });
        }
        if let Ok(date) = DateTime::parse_from_rfc3339(input) {
            return Ok(Schedule::At(date.with_timezone(&Utc)));
        }
        Err(ScheduleError::UnrecognizedInput(input.to_string()))
    }

    /// Parse a cron expression, reporting why it is malformed.
    pub fn cron(expression: &str) -> Result<Schedule, ScheduleError> {
        CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            tz: None,
        })
    }

    /// Restrict this schedule to fire only inside `[start, end]`.
    pub fn between(self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Schedule {
        Schedule::Bounded {
            base: Box::new(self),
            start,
            end,
            tz: None,
        }
    }

    /// Evaluate this schedule in `tz` unless an inner schedule already
    /// carries its own timezone.
    pub fn in_timezone(self, tz: Tz) -> Schedule {
        match self {
            Schedule::Cron { expression, tz: inner } => Schedule::Cron {
                expression,
                tz: inner.or(Some(tz)),
            },
            Schedule::Bounded { base, start, end, tz: inner } => Schedule::Bounded {
                base,
                start,
                end,
                tz: inner.or(Some(tz)),
            },
            other => Schedule::Bounded {
                base: Box::new(other),
                start: None,
                end: None,
                tz: Some(tz),
            },
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl From<DateTime<Utc>> for Schedule {
    fn from(date: DateTime<Utc>) -> Self {
        Schedule::At(date)
    }
}

impl From<RecurrenceRule> for Schedule {
    fn from(rule: RecurrenceRule) -> Self {
        Schedule::Recurrence(rule)
    }
}

/// Normalized recurrence carried by a queued invocation. `Once` is the
/// does-not-recur sentinel for one-shot firings.
#[derive(Debug, Clone)]
pub(crate) enum Recurrence {
    Once,
    Rule(RecurrenceRule),
    Cron {
        schedule: CronSchedule,
        tz: Option<Tz>,
    },
}

impl Recurrence {
    pub(crate) fn recurs(&self) -> bool {
        !matches!(self, Recurrence::Once)
    }

    /// The first fire date strictly after `after`, or `None` when the
    /// recurrence is exhausted.
    pub(crate) fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Once => None,
            Recurrence::Rule(rule) => rule.next_fire_date(after),
            Recurrence::Cron { schedule, tz } => cron_next_after(schedule, *tz, after),
        }
    }
}

fn cron_next_after(
    schedule: &CronSchedule,
    tz: Option<Tz>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match tz {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    }
}

/// A classified schedule: the first fire date plus everything the queue
/// needs to keep the job alive afterwards.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub(crate) first: DateTime<Utc>,
    pub(crate) recurrence: Recurrence,
    pub(crate) end: Option<DateTime<Utc>>,
    pub(crate) one_time: bool,
}

/// Classify `schedule` and compute its first fire date relative to `now`.
pub(crate) fn resolve(schedule: &Schedule, now: DateTime<Utc>) -> Result<Resolved, ScheduleError> {
    resolve_bounded(schedule, now, None, None, None)
}

fn resolve_bounded(
    schedule: &Schedule,
    now: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    tz: Option<Tz>,
) -> Result<Resolved, ScheduleError> {
    match schedule {
        Schedule::Bounded {
            base,
            start: inner_start,
            end: inner_end,
            tz: inner_tz,
        } => resolve_bounded(
            base,
            now,
            inner_start.or(start),
            inner_end.or(end),
            inner_tz.or(tz),
        ),

        Schedule::Cron { expression, tz: inner_tz } => {
            let parsed = CronSchedule::from_str(expression).map_err(|e| {
                ScheduleError::InvalidCronExpression {
                    expression: expression.clone(),
                    reason: e.to_string(),
                }
            })?;
            let tz = inner_tz.or(tz);
            let anchor = anchor_date(now, start);
            let first =
                cron_next_after(&parsed, tz, anchor).ok_or(ScheduleError::NoUpcomingFireDate)?;
            check_end(first, end)?;
            Ok(Resolved {
                first,
                recurrence: Recurrence::Cron { schedule: parsed, tz },
                end,
                one_time: false,
            })
        }

        Schedule::At(date) => {
            if *date < now {
                return Err(ScheduleError::FireDateInPast(*date));
            }
            check_end(*date, end)?;
            Ok(Resolved {
                first: *date,
                recurrence: Recurrence::Once,
                end,
                one_time: true,
            })
        }

        Schedule::Recurrence(rule) => {
            let mut rule = rule.clone();
            if rule.tz.is_none() {
                rule.tz = tz;
            }
            if !rule.is_valid() {
                return Err(ScheduleError::InvalidRecurrenceRule);
            }
            let anchor = anchor_date(now, start);
            let first = rule
                .next_fire_date(anchor)
                .ok_or(ScheduleError::NoUpcomingFireDate)?;
            check_end(first, end)?;
            Ok(Resolved {
                first,
                recurrence: Recurrence::Rule(rule),
                end,
                one_time: false,
            })
        }
    }
}

/// First fire dates are searched from the later of `now` and the window
/// start, so a past start bound never replays old occurrences.
fn anchor_date(now: DateTime<Utc>, start: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match start {
        Some(start) => start.max(now),
        None => now,
    }
}

fn check_end(first: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<(), ScheduleError> {
    match end {
        Some(end) if first > end => Err(ScheduleError::NoUpcomingFireDate),
        _ => Ok(()),
    }
}
