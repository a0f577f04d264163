//! File-source rating and preference ordering
//!
//! Downloaders prefer sources that host their own centre's data. Ratings
//! may later grow historical-failure penalties, so the scoring is behind
//! a strategy trait; the ordering contract is fixed: highest rating is
//! attempted first, ties broken by ascending source id.

use crate::entities::SourceCandidate;

/// Extra weight for a source owned by the centre that produced the data.
pub const AFFINITY_WEIGHT: i64 = 30;

/// Pluggable scoring strategy for candidate sources.
pub trait SourceRater: Send + Sync {
    fn rate(&self, candidate: &SourceCandidate) -> i64;
}

/// Default strategy: affinity only.
#[derive(Debug, Default)]
pub struct AffinityRater;

impl SourceRater for AffinityRater {
    fn rate(&self, candidate: &SourceCandidate) -> i64 {
        match candidate.producer_centre_id {
            Some(producer) if producer == candidate.source_centre_id => AFFINITY_WEIGHT,
            _ => 0,
        }
    }
}

/// Rate every candidate and order them into the attempt sequence:
/// descending rating, ties by ascending source id.
pub fn sort_by_preference<R: SourceRater + ?Sized>(
    rater: &R,
    mut candidates: Vec<SourceCandidate>,
) -> Vec<SourceCandidate> {
    for candidate in candidates.iter_mut() {
        candidate.rating = rater.rate(candidate);
    }
    candidates.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.source_id.cmp(&b.source_id)));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(source_id: i64, source_centre: i64, producer: Option<i64>) -> SourceCandidate {
        SourceCandidate {
            fsz_id: source_id * 100,
            source_id,
            source_centre_id: source_centre,
            protocol: "ftp".to_string(),
            hostname: format!("host{source_id}"),
            base_path: "/impc/".to_string(),
            username: "anonymous".to_string(),
            accesskey: "secret".to_string(),
            producer_centre_id: producer,
            rating: 0,
        }
    }

    #[test]
    fn affinity_matched_source_gets_weight() {
        let rater = AffinityRater;
        assert_eq!(rater.rate(&candidate(1, 7, Some(7))), AFFINITY_WEIGHT);
        assert_eq!(rater.rate(&candidate(1, 7, Some(9))), 0);
        assert_eq!(rater.rate(&candidate(1, 7, None)), 0);
    }

    #[test]
    fn affinity_matched_sources_are_attempted_first() {
        let sorted = sort_by_preference(
            &AffinityRater,
            vec![
                candidate(1, 3, Some(7)),
                candidate(2, 7, Some(7)),
                candidate(3, 5, Some(7)),
            ],
        );
        assert_eq!(sorted[0].source_id, 2);
        assert!(sorted[0].rating > sorted[1].rating);
        // Non-matching candidates keep a deterministic id order.
        assert_eq!(sorted[1].source_id, 1);
        assert_eq!(sorted[2].source_id, 3);
    }

    #[test]
    fn ties_break_by_ascending_source_id() {
        let sorted = sort_by_preference(
            &AffinityRater,
            vec![
                candidate(9, 7, Some(7)),
                candidate(2, 7, Some(7)),
                candidate(5, 7, Some(7)),
            ],
        );
        let ids: Vec<i64> = sorted.iter().map(|c| c.source_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }
}
