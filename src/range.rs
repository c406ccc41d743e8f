// Numeric range constraint for recurrence rule fields

use serde::{Deserialize, Serialize};

/// An inclusive-start numeric range with an optional step, used to constrain
/// a single calendar field of a [`crate::RecurrenceRule`].
///
/// With a step of 0 or 1 the range is a plain inclusive interval. With a
/// larger step only the values `start + k * step` match, and the end bound
/// becomes exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: i32,
    pub end: i32,
    pub step: i32,
}

impl Default for Range {
    fn default() -> Self {
        Self {
            start: 0,
            end: 60,
            step: 1,
        }
    }
}

impl Range {
    pub fn new(start: i32, end: i32, step: i32) -> Self {
        Self { start, end, step }
    }

    /// Whether `value` satisfies this range constraint.
    pub fn contains(&self, value: i32) -> bool {
        if self.step <= 1 {
            value >= self.start && value <= self.end
        } else {
            value >= self.start
                && value < self.end
                && (value - self.start) % self.step == 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_range() {
        let r = Range::default();
        assert_eq!(r, Range::new(0, 60, 1));
    }

    #[test]
    fn test_unit_step_is_inclusive_interval() {
        let r = Range::new(2, 6, 1);
        assert!(!r.contains(1));
        assert!(r.contains(2));
        assert!(r.contains(4));
        assert!(r.contains(6));
        assert!(!r.contains(7));
    }

    #[test]
    fn test_zero_step_behaves_like_unit_step() {
        let r = Range::new(2, 6, 0);
        assert!(r.contains(6));
        assert!(!r.contains(7));
    }

    #[test]
    fn test_stepped_range_matches_multiples_only() {
        let r = Range::new(0, 10, 3);
        assert!(r.contains(0));
        assert!(r.contains(3));
        assert!(r.contains(9));
        assert!(!r.contains(1));
        assert!(!r.contains(2));
    }

    #[test]
    fn test_stepped_range_end_is_exclusive() {
        let r = Range::new(0, 9, 3);
        assert!(r.contains(6));
        assert!(!r.contains(9));
    }

    #[test]
    fn test_stepped_range_ignores_values_below_start() {
        let r = Range::new(5, 20, 5);
        assert!(!r.contains(0));
        assert!(r.contains(5));
        assert!(r.contains(15));
    }
}
