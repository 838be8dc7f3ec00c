//! Run ids for remote executions.
//!
//! Each remote run writes its outcome under a fresh id so concurrent
//! overlapping runs of the same invocation can never clobber each
//! other's output. The timestamp prefix makes lexicographic order agree
//! with wall-clock order, which is how the orchestrator picks "newest".

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;

use crate::humenc;

/// Generate a fresh run id: `YYMMDDHHmm-TwoWords`.
pub fn new_run_id() -> String {
    run_id_at(Utc::now())
}

/// Generate a run id for an explicit instant (timestamp part only is fixed).
pub fn run_id_at(when: DateTime<Utc>) -> String {
    let mut rng = rand::rng();
    let words: [u8; 2] = rng.random();
    format!(
        "{}-{}{}",
        when.format("%y%m%d%H%M"),
        humenc::word(words[0]),
        humenc::word(words[1]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        let (stamp, words) = id.split_once('-').unwrap();
        assert_eq!(stamp.len(), 10);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(words.len(), 16);
    }

    #[test]
    fn test_run_ids_sort_by_time() {
        let early = run_id_at(Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap());
        let late = run_id_at(Utc.with_ymd_and_hms(2025, 3, 2, 9, 30, 0).unwrap());
        assert!(early < late);
    }

    #[test]
    fn test_run_ids_are_unlikely_to_collide() {
        let now = Utc::now();
        let ids: std::collections::HashSet<String> = (0..64).map(|_| run_id_at(now)).collect();
        assert!(ids.len() > 1);
    }
}
