// Property-based tests for ranges and recurrence rules

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use proptest::prelude::*;
use schedulite::{recur_match, FieldMatcher, Range, RecurrenceRule};

/// Base dates between 2000-01-01 and 2049-12-31, second precision.
fn base_date() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800i64..2_524_607_999i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

/// *For any* range and probe value, `contains` agrees with the step formula:
/// a plain inclusive interval when the step is 0 or 1, otherwise exactly the
/// values `start + k * step` below the (exclusive) end.
#[test]
fn property_range_contains_matches_step_formula() {
    proptest!(|(
        start in -100i32..100,
        span in 0i32..200,
        step in 0i32..8,
        value in -150i32..350
    )| {
        let end = start + span;
        let range = Range::new(start, end, step);
        let expected = if step <= 1 {
            value >= start && value <= end
        } else {
            (0..)
                .map(|k| start + k * step)
                .take_while(|&candidate| candidate < end)
                .any(|candidate| candidate == value)
        };
        prop_assert_eq!(range.contains(value), expected);
    });
}

/// *For any* list matcher, a value matches iff it matches some element.
#[test]
fn property_list_matcher_is_or_of_elements() {
    proptest!(|(
        values in prop::collection::vec(0i32..60, 1..6),
        probe in 0i32..60
    )| {
        let matcher = FieldMatcher::List(values.iter().copied().map(FieldMatcher::Value).collect());
        prop_assert_eq!(recur_match(probe, Some(&matcher)), values.contains(&probe));
        prop_assert!(recur_match(probe, None));
    });
}

/// *For any* rule fixing hour, minute and second, the next fire date is
/// strictly after the base, lands exactly on the constrained time of day,
/// and arrives within a day.
#[test]
fn property_fixed_time_of_day_rule_fires_within_a_day() {
    proptest!(|(
        base in base_date(),
        hour in 0i32..24,
        minute in 0i32..60,
        second in 0i32..60
    )| {
        let rule = RecurrenceRule {
            hour: Some(FieldMatcher::Value(hour)),
            minute: Some(FieldMatcher::Value(minute)),
            second: Some(FieldMatcher::Value(second)),
            ..Default::default()
        };
        let next = rule.next_fire_date(base).expect("daily rule always has a next date");
        prop_assert!(next > base);
        prop_assert_eq!(next.hour() as i32, hour);
        prop_assert_eq!(next.minute() as i32, minute);
        prop_assert_eq!(next.second() as i32, second);
        prop_assert!(next - base <= Duration::hours(24) + Duration::seconds(1));
    });
}

/// *For any* rule constraining only the second, the next fire date keeps the
/// constrained second and never skips more than one minute ahead.
#[test]
fn property_second_rule_advances_at_most_one_minute() {
    proptest!(|(base in base_date(), second in 0i32..60)| {
        let rule = RecurrenceRule {
            second: Some(FieldMatcher::Value(second)),
            ..Default::default()
        };
        let next = rule.next_fire_date(base).expect("second rule always has a next date");
        prop_assert!(next > base);
        prop_assert_eq!(next.second() as i32, second);
        prop_assert!(next - base <= Duration::seconds(61));
    });
}

/// *For any* stepped hour range anchored at zero, the next fire date lands on
/// a whole hour divisible by the step.
#[test]
fn property_stepped_hour_range_lands_on_step_multiple() {
    proptest!(|(base in base_date(), step in 2i32..7)| {
        let rule = RecurrenceRule {
            hour: Some(FieldMatcher::Range(Range::new(0, 23, step))),
            minute: Some(FieldMatcher::Value(0)),
            ..Default::default()
        };
        let next = rule.next_fire_date(base).expect("stepped hour rule always has a next date");
        prop_assert!(next > base);
        prop_assert_eq!(next.hour() as i32 % step, 0);
        prop_assert_eq!(next.minute(), 0);
        prop_assert_eq!(next.second(), 0);
    });
}

/// *For any* day-of-week constraint, the next fire date falls on that weekday
/// at most a week and a day out.
#[test]
fn property_day_of_week_rule_lands_on_that_weekday() {
    proptest!(|(base in base_date(), day_of_week in 0i32..7)| {
        let rule = RecurrenceRule {
            day_of_week: Some(FieldMatcher::Value(day_of_week)),
            hour: Some(FieldMatcher::Value(0)),
            minute: Some(FieldMatcher::Value(0)),
            ..Default::default()
        };
        let next = rule.next_fire_date(base).expect("weekly rule always has a next date");
        prop_assert!(next > base);
        prop_assert_eq!(next.weekday().num_days_from_sunday() as i32, day_of_week);
        prop_assert!(next - base <= Duration::days(8));
    });
}

/// *For any* out-of-range hour constraint, the rule is invalid and never
/// produces a fire date.
#[test]
fn property_out_of_range_hour_never_fires() {
    proptest!(|(base in base_date(), hour in 24i32..1_000)| {
        let rule = RecurrenceRule {
            hour: Some(FieldMatcher::Value(hour)),
            ..Default::default()
        };
        prop_assert!(!rule.is_valid());
        prop_assert_eq!(rule.next_fire_date(base), None);
    });
}

/// *For any* base date, a rule with `recurs` unset never produces a fire
/// date even when every field would match.
#[test]
fn property_non_recurring_rule_never_fires() {
    proptest!(|(base in base_date())| {
        let rule = RecurrenceRule {
            recurs: false,
            ..Default::default()
        };
        prop_assert_eq!(rule.next_fire_date(base), None);
    });
}

/// *For any* serializable rule, a serde round trip preserves it.
#[test]
fn property_rule_serde_round_trip() {
    proptest!(|(
        hour in 0i32..24,
        minute_start in 0i32..30,
        minute_span in 0i32..30
    )| {
        let rule = RecurrenceRule {
            hour: Some(FieldMatcher::Value(hour)),
            minute: Some(FieldMatcher::Range(Range::new(
                minute_start,
                minute_start + minute_span,
                1,
            ))),
            ..Default::default()
        };
        let json = serde_json::to_string(&rule).unwrap();
        let back: RecurrenceRule = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, rule);
    });
}
