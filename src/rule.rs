// Calendar recurrence rules and next-fire-date computation

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::range::Range;

/// Day counts per month used to validate `date` constraints. February is 29
/// so leap-day rules stay legal.
const LAST_DAY_OF_MONTH: [i32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Upper bound on candidate advances before a rule is declared unmatchable.
/// Legal sparse rules (Feb 29, a fixed year decades out) stay far below this;
/// contradictory rules (day 30 in a February-only month set) would otherwise
/// search forever.
const MAX_ADVANCE_STEPS: usize = 10_000;

/// Constraint on a single calendar field: a fixed value, a [`Range`], or a
/// list of either (list elements match with OR semantics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldMatcher {
    Value(i32),
    Range(Range),
    List(Vec<FieldMatcher>),
}

impl From<i32> for FieldMatcher {
    fn from(value: i32) -> Self {
        FieldMatcher::Value(value)
    }
}

impl From<Range> for FieldMatcher {
    fn from(range: Range) -> Self {
        FieldMatcher::Range(range)
    }
}

impl From<Vec<i32>> for FieldMatcher {
    fn from(values: Vec<i32>) -> Self {
        FieldMatcher::List(values.into_iter().map(FieldMatcher::Value).collect())
    }
}

/// Whether `value` satisfies `matcher`. An absent matcher means the field is
/// unconstrained and always matches.
pub fn recur_match(value: i32, matcher: Option<&FieldMatcher>) -> bool {
    match matcher {
        None => true,
        Some(FieldMatcher::Value(v)) => *v == value,
        Some(FieldMatcher::Range(r)) => r.contains(value),
        Some(FieldMatcher::List(items)) => items.iter().any(|m| recur_match(value, Some(m))),
    }
}

/// A repeating calendar pattern: up to seven per-field constraints, each
/// `None` (unconstrained) or a [`FieldMatcher`].
///
/// `month` is zero-based (0 = January) and `day_of_week` counts from Sunday
/// (0 = Sunday .. 6 = Saturday). The default rule constrains `second` to 0,
/// so a rule that only sets `minute` fires once per matching minute rather
/// than sixty times.
///
/// Fields are public: build a rule with [`RecurrenceRule::new`] (or struct
/// update syntax) and assign constraints directly before scheduling it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrenceRule {
    pub year: Option<FieldMatcher>,
    pub month: Option<FieldMatcher>,
    pub date: Option<FieldMatcher>,
    pub day_of_week: Option<FieldMatcher>,
    pub hour: Option<FieldMatcher>,
    pub minute: Option<FieldMatcher>,
    pub second: Option<FieldMatcher>,
    /// A rule with `recurs` unset never produces a fire date.
    pub recurs: bool,
    /// Timezone the calendar fields are evaluated in. UTC when unset.
    pub tz: Option<Tz>,
}

impl Default for RecurrenceRule {
    fn default() -> Self {
        Self {
            year: None,
            month: None,
            date: None,
            day_of_week: None,
            hour: None,
            minute: None,
            second: Some(FieldMatcher::Value(0)),
            recurs: true,
            tz: None,
        }
    }
}

impl RecurrenceRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every constrained field stays inside its calendar-legal
    /// bounds. An invalid rule can never produce a fire date.
    ///
    /// The `date` bound tightens to the month's day count only when `month`
    /// is a single fixed value; otherwise days up to 31 are accepted and the
    /// search simply skips months that are too short.
    pub fn is_valid(&self) -> bool {
        let max_date = match &self.month {
            Some(FieldMatcher::Value(m)) if (0..=11).contains(m) => LAST_DAY_OF_MONTH[*m as usize],
            _ => 31,
        };
        matcher_within(self.month.as_ref(), 0, 11)
            && matcher_within(self.date.as_ref(), 1, max_date)
            && matcher_within(self.day_of_week.as_ref(), 0, 6)
            && matcher_within(self.hour.as_ref(), 0, 23)
            && matcher_within(self.minute.as_ref(), 0, 59)
            && matcher_within(self.second.as_ref(), 0, 59)
    }

    /// The first instant strictly after `base` matching every constraint, or
    /// `None` when the rule does not recur, is invalid, or can never match
    /// again. `None` terminates the recurrence permanently; it is not an
    /// error.
    ///
    /// Candidates are tested field by field in the order year, month, date,
    /// day-of-week, hour, minute, second. The first mismatching field is
    /// advanced by exactly one of its own units and the tests restart from
    /// the year. Advancing the year resets month, date and time to their
    /// minimums; advancing the month only adds one calendar month and keeps
    /// the day and time (clamped to the shorter month when needed). This
    /// asymmetry is intentional: existing schedules depend on it.
    pub fn next_fire_date(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.recurs || !self.is_valid() {
            return None;
        }
        let tz = self.tz.unwrap_or(chrono_tz::UTC);
        let mut next =
            base.with_timezone(&tz).with_nanosecond(0)? + Duration::seconds(1);

        for _ in 0..MAX_ADVANCE_STEPS {
            if let Some(FieldMatcher::Value(year)) = &self.year {
                // A fixed year already behind the candidate can never match.
                if *year < next.year() {
                    return None;
                }
            }
            if !recur_match(next.year(), self.year.as_ref()) {
                next = start_of_next_year(&tz, next.year())?;
                continue;
            }
            if !recur_match(next.month0() as i32, self.month.as_ref()) {
                next = add_one_month(&tz, next)?;
                continue;
            }
            if !recur_match(next.day() as i32, self.date.as_ref()) {
                next = start_of_next_day(&tz, next)?;
                continue;
            }
            if !recur_match(
                next.weekday().num_days_from_sunday() as i32,
                self.day_of_week.as_ref(),
            ) {
                next = start_of_next_day(&tz, next)?;
                continue;
            }
            if !recur_match(next.hour() as i32, self.hour.as_ref()) {
                next = start_of_next_hour(&tz, next)?;
                continue;
            }
            if !recur_match(next.minute() as i32, self.minute.as_ref()) {
                next = start_of_next_minute(&tz, next)?;
                continue;
            }
            if !recur_match(next.second() as i32, self.second.as_ref()) {
                next += Duration::seconds(1);
                continue;
            }
            return Some(next.with_timezone(&Utc));
        }
        None
    }
}

fn matcher_within(matcher: Option<&FieldMatcher>, min: i32, max: i32) -> bool {
    match matcher {
        None => true,
        Some(FieldMatcher::Value(v)) => (min..=max).contains(v),
        Some(FieldMatcher::Range(r)) => r.start >= min && r.end <= max,
        Some(FieldMatcher::List(items)) => {
            items.iter().all(|m| matcher_within(Some(m), min, max))
        }
    }
}

/// Map a wall-clock time onto the timezone's timeline. Ambiguous times
/// (fall-back) resolve to the earlier instant; nonexistent times
/// (spring-forward gap) skip ahead hour by hour until they land.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut probe = naive;
    for _ in 0..4 {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => return Some(dt),
            LocalResult::None => probe += Duration::hours(1),
        }
    }
    None
}

fn start_of_next_year(tz: &Tz, year: i32) -> Option<DateTime<Tz>> {
    let naive = NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?.and_hms_opt(0, 0, 0)?;
    resolve_local(tz, naive)
}

fn add_one_month(tz: &Tz, t: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let date = t.date_naive().checked_add_months(Months::new(1))?;
    resolve_local(tz, date.and_time(t.time()))
}

fn start_of_next_day(tz: &Tz, t: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let date = t.date_naive().checked_add_days(Days::new(1))?;
    resolve_local(tz, date.and_hms_opt(0, 0, 0)?)
}

fn start_of_next_hour(tz: &Tz, t: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let stepped = t + Duration::hours(1);
    resolve_local(tz, stepped.naive_local().with_minute(0)?.with_second(0)?)
}

fn start_of_next_minute(tz: &Tz, t: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let stepped = t + Duration::minutes(1);
    resolve_local(tz, stepped.naive_local().with_second(0)?)
}
