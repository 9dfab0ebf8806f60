//! Gallery search with a similarity threshold and a confidence-gap rule.

use crate::types::{Embedding, Template};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.30;
pub const DEFAULT_MIN_CONFIDENCE_GAP: f32 = 0.02;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// No enrolled template shares the query's dimension.
    #[error("gallery is empty")]
    EmptyGallery,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub similarity_threshold: f32,
    pub min_confidence_gap: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            min_confidence_gap: DEFAULT_MIN_CONFIDENCE_GAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub user_id: i64,
    pub name: String,
    pub similarity: f32,
    pub distance: f32,
    pub is_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Accepted,
    LowSimilarity,
    AmbiguousMatch,
}

/// Ranked candidates plus the decision taken on them.
#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    /// Comparable candidates, best first.
    pub candidates: Vec<MatchCandidate>,
    pub decision: MatchDecision,
    pub confidence_gap: f32,
    pub threshold: f32,
}

impl MatchReport {
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }

    pub fn second(&self) -> Option<&MatchCandidate> {
        self.candidates.get(1)
    }

    /// The accepted identity, if any.
    pub fn accepted(&self) -> Option<&MatchCandidate> {
        match self.decision {
            MatchDecision::Accepted => self.best(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateMatcher {
    policy: MatchPolicy,
}

impl TemplateMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Rank the gallery against a query and apply the decision rule.
    ///
    /// Templates whose length differs from the query's are skipped.
    pub fn search(&self, query: &Embedding, gallery: &[Template]) -> Result<MatchReport, MatchError> {
        let threshold = self.policy.similarity_threshold;

        let mut candidates: Vec<MatchCandidate> = gallery
            .iter()
            .filter(|t| t.embedding.len() == query.len())
            .map(|t| {
                let similarity = query.similarity(&t.embedding);
                MatchCandidate {
                    user_id: t.user_id,
                    name: t.name.clone(),
                    similarity,
                    distance: 1.0 - similarity,
                    is_match: similarity >= threshold,
                }
            })
            .collect();

        if candidates.is_empty() {
            tracing::debug!(
                gallery = gallery.len(),
                dimension = query.len(),
                "no comparable templates"
            );
            return Err(MatchError::EmptyGallery);
        }

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let best = candidates[0].similarity;
        let second = candidates.get(1).map_or(0.0, |c| c.similarity);
        let confidence_gap = best - second;
        let decision = self.decide(best, confidence_gap);

        tracing::debug!(
            best,
            second,
            gap = confidence_gap,
            ?decision,
            candidates = candidates.len(),
            "gallery searched"
        );

        Ok(MatchReport {
            candidates,
            decision,
            confidence_gap,
            threshold,
        })
    }

    /// Threshold first, then gap. Gap is compared with a small tolerance so
    /// that a decimal gap equal to the minimum is not lost to rounding.
    pub fn decide(&self, best: f32, gap: f32) -> MatchDecision {
        const EPSILON: f32 = 1e-6;
        if best < self.policy.similarity_threshold {
            MatchDecision::LowSimilarity
        } else if gap + EPSILON < self.policy.min_confidence_gap {
            MatchDecision::AmbiguousMatch
        } else {
            MatchDecision::Accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(user_id: i64, values: &[f32]) -> Template {
        Template {
            user_id,
            name: format!("user{user_id}"),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    /// Unit vector in the (e0, e1) plane whose cosine against e0 is `cos`.
    fn at_cosine(user_id: i64, cos: f32) -> Template {
        template(user_id, &[cos, (1.0 - cos * cos).sqrt(), 0.0])
    }

    fn query() -> Embedding {
        Embedding::new(vec![1.0, 0.0, 0.0])
    }

    #[test]
    fn test_clear_winner_accepted() {
        let gallery = vec![at_cosine(1, 0.3), at_cosine(2, 0.5)];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        assert_eq!(report.decision, MatchDecision::Accepted);
        assert_eq!(report.accepted().unwrap().user_id, 2);
        assert!((report.confidence_gap - 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_narrow_gap_is_ambiguous() {
        let gallery = vec![at_cosine(1, 0.31), at_cosine(2, 0.30)];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        assert_eq!(report.decision, MatchDecision::AmbiguousMatch);
        assert!(report.accepted().is_none());
    }

    #[test]
    fn test_below_threshold_is_low_similarity() {
        let gallery = vec![at_cosine(1, 0.2)];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        assert_eq!(report.decision, MatchDecision::LowSimilarity);
        assert!(!report.best().unwrap().is_match);
    }

    #[test]
    fn test_single_candidate_gap_against_zero() {
        let gallery = vec![at_cosine(7, 0.9)];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        assert_eq!(report.decision, MatchDecision::Accepted);
        assert!((report.confidence_gap - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_empty_gallery() {
        let result = TemplateMatcher::default().search(&query(), &[]);
        assert_eq!(result.unwrap_err(), MatchError::EmptyGallery);
    }

    #[test]
    fn test_mismatched_dimensions_are_skipped() {
        let gallery = vec![template(1, &[1.0, 0.0]), at_cosine(2, 0.8)];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].user_id, 2);

        let only_other = vec![template(1, &[1.0, 0.0])];
        assert!(TemplateMatcher::default().search(&query(), &only_other).is_err());
    }

    #[test]
    fn test_ranked_descending_and_bounded() {
        let gallery = vec![
            at_cosine(1, -0.4),
            at_cosine(2, 0.95),
            at_cosine(3, 0.1),
            template(4, &[-1.0, 0.0, 0.0]),
        ];
        let report = TemplateMatcher::default().search(&query(), &gallery).unwrap();
        let sims: Vec<f32> = report.candidates.iter().map(|c| c.similarity).collect();
        assert!(sims.windows(2).all(|w| w[0] >= w[1]), "{sims:?}");
        assert!(sims.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert_eq!(report.best().unwrap().user_id, 2);
        let last = report.candidates.last().unwrap();
        assert!((last.distance - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_policy_is_tunable() {
        let strict = TemplateMatcher::new(MatchPolicy {
            similarity_threshold: 0.6,
            min_confidence_gap: 0.02,
        });
        let gallery = vec![at_cosine(1, 0.5)];
        let report = strict.search(&query(), &gallery).unwrap();
        assert_eq!(report.decision, MatchDecision::LowSimilarity);
    }

    #[test]
    fn test_decide_direct() {
        let matcher = TemplateMatcher::default();
        assert_eq!(matcher.decide(0.5, 0.2), MatchDecision::Accepted);
        assert_eq!(matcher.decide(0.31, 0.01), MatchDecision::AmbiguousMatch);
        assert_eq!(matcher.decide(0.29, 0.29), MatchDecision::LowSimilarity);
        assert_eq!(matcher.decide(0.30, 0.02), MatchDecision::Accepted);
    }

    #[test]
    fn test_gap_equal_to_minimum_survives_rounding() {
        let matcher = TemplateMatcher::default();
        let gap = 0.52f32 - 0.50f32;
        assert!(gap < 0.02);
        assert_eq!(matcher.decide(0.52, gap), MatchDecision::Accepted);
        assert_eq!(matcher.decide(0.52, 0.0199), MatchDecision::AmbiguousMatch);
    }
}
