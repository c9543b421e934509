//! Spaced-repetition review scheduling for learned-policy entries.

use chrono::{DateTime, Duration, Utc};

/// Review intervals indexed by completed review count:
/// 1 week → 2 weeks → 1 month → 2 months → 4 months (cap).
fn intervals() -> [Duration; 5] {
    [
        Duration::days(7),
        Duration::days(14),
        Duration::days(30),
        Duration::days(60),
        Duration::days(120),
    ]
}

/// Time until the next review, given how many reviews have been completed.
#[must_use]
pub fn next_review_interval(review_count: u32) -> Duration {
    let table = intervals();
    let index = (review_count as usize).min(table.len() - 1);
    table[index]
}

/// Absolute time of the next review.
#[must_use]
pub fn next_review_time(last_reviewed: DateTime<Utc>, review_count: u32) -> DateTime<Utc> {
    last_reviewed + next_review_interval(review_count)
}

/// Whether the next review time has passed.
#[must_use]
pub fn needs_review(next_review: DateTime<Utc>) -> bool {
    Utc::now() > next_review
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_grow_then_cap() {
        assert_eq!(next_review_interval(0), Duration::days(7));
        assert_eq!(next_review_interval(1), Duration::days(14));
        assert_eq!(next_review_interval(2), Duration::days(30));
        assert_eq!(next_review_interval(3), Duration::days(60));
        assert_eq!(next_review_interval(4), Duration::days(120));
        assert_eq!(next_review_interval(40), Duration::days(120));
    }

    #[test]
    fn test_next_review_time_offsets_last_review() {
        let last = Utc::now();
        assert_eq!(next_review_time(last, 0), last + Duration::days(7));
    }

    #[test]
    fn test_needs_review() {
        assert!(needs_review(Utc::now() - Duration::hours(1)));
        assert!(!needs_review(Utc::now() + Duration::hours(1)));
    }
}
