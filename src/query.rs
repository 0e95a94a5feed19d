/// Tag queries for biasing generation.
///
/// A query decides which stored edges take part in a generation step and,
/// optionally, how much extra weight each candidate target gets:
///
/// - [`TagQuery::Always`] matches every edge
/// - [`TagQuery::Tag`] matches edges carrying exactly that tag
/// - [`TagQuery::Not`] and [`TagQuery::Or`] combine filters
/// - [`TagQuery::Score`] (top level only) filters with `base` and then adds
///   `weight` to a target's score for every sub-query that matches at least
///   one tag stored for that target
///
/// # Example
///
/// ```ignore
/// use koru_chain::query::TagQuery;
///
/// // Prefer targets that were trained under :formal, never :slang
/// let query = TagQuery::score(
///     TagQuery::not(TagQuery::tag("slang")),
///     vec![(TagQuery::tag("formal"), 3)],
/// );
/// ```
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ChainError, ChainResult};
use crate::storage::ContextEdges;
use crate::types::{Tag, Token};

/// A tag query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagQuery {
    /// Matches every edge.
    Always,
    /// Matches edges carrying this tag.
    Tag(Tag),
    /// Logical NOT.
    Not(Box<TagQuery>),
    /// Logical OR.
    Or(Box<TagQuery>, Box<TagQuery>),
    /// Filter with `base`, then add weights for matching sub-queries.
    Score {
        base: Box<TagQuery>,
        scores: Vec<(TagQuery, u64)>,
    },
}

impl Default for TagQuery {
    fn default() -> Self {
        TagQuery::Always
    }
}

impl TagQuery {
    /// Match a single tag.
    pub fn tag(tag: impl Into<Tag>) -> Self {
        Self::Tag(tag.into())
    }

    /// Negate a query.
    #[allow(clippy::should_implement_trait)]
    pub fn not(query: TagQuery) -> Self {
        Self::Not(Box::new(query))
    }

    /// Either of two queries.
    pub fn or(a: TagQuery, b: TagQuery) -> Self {
        Self::Or(Box::new(a), Box::new(b))
    }

    /// Both queries, expressed as `NOT(OR(NOT a, NOT b))`.
    pub fn and(a: TagQuery, b: TagQuery) -> Self {
        Self::not(Self::or(Self::not(a), Self::not(b)))
    }

    /// A scoring query.
    pub fn score(base: TagQuery, scores: Vec<(TagQuery, u64)>) -> Self {
        Self::Score {
            base: Box::new(base),
            scores,
        }
    }

    /// Reject `Score` anywhere below the top level.
    pub fn validate(&self) -> ChainResult<()> {
        match self {
            TagQuery::Score { base, scores } => {
                base.validate_filter()?;
                for (sub, _) in scores {
                    sub.validate_filter()?;
                }
                Ok(())
            }
            other => other.validate_filter(),
        }
    }

    fn validate_filter(&self) -> ChainResult<()> {
        match self {
            TagQuery::Always | TagQuery::Tag(_) => Ok(()),
            TagQuery::Not(q) => q.validate_filter(),
            TagQuery::Or(a, b) => {
                a.validate_filter()?;
                b.validate_filter()
            }
            TagQuery::Score { .. } => Err(ChainError::InvalidQuery {
                reason: "Score is only allowed at the top level".to_string(),
            }),
        }
    }

    /// Evaluate this query as a filter against one edge tag.
    pub fn matches(&self, tag: &Tag) -> bool {
        match self {
            TagQuery::Always => true,
            TagQuery::Tag(expected) => expected == tag,
            TagQuery::Not(q) => !q.matches(tag),
            TagQuery::Or(a, b) => a.matches(tag) || b.matches(tag),
            TagQuery::Score { base, .. } => base.matches(tag),
        }
    }

    fn parts(&self) -> (&TagQuery, &[(TagQuery, u64)]) {
        match self {
            TagQuery::Score { base, scores } => (base, scores),
            other => (other, &[]),
        }
    }

    /// Evaluate against every edge of one context.
    ///
    /// A target is included when at least one of its edges matches the base
    /// filter. Returns the included targets in order with their additive
    /// score, which saturates at `u64::MAX`.
    pub fn evaluate(&self, edges: &ContextEdges) -> Vec<ScoredTarget> {
        let (base, scores) = self.parts();

        let mut by_target: BTreeMap<&Token, BTreeSet<&Tag>> = BTreeMap::new();
        for (target, tag) in edges.keys() {
            by_target.entry(target).or_default().insert(tag);
        }

        by_target
            .into_iter()
            .filter(|(_, tags)| tags.iter().any(|tag| base.matches(tag)))
            .map(|(target, tags)| {
                let score = scores
                    .iter()
                    .filter(|(sub, _)| tags.iter().any(|tag| sub.matches(tag)))
                    .map(|(_, w)| *w)
                    .fold(0u64, u64::saturating_add);
                ScoredTarget {
                    target: target.clone(),
                    score,
                }
            })
            .collect()
    }
}

/// One candidate produced by [`TagQuery::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredTarget {
    /// Candidate next token
    pub target: Token,
    /// Additive score from `Score` sub-queries
    pub score: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(items: &[(&str, Tag, u64)]) -> ContextEdges {
        items
            .iter()
            .map(|(t, tag, w)| ((Token::text(*t), tag.clone()), *w))
            .collect()
    }

    #[test]
    fn test_always_includes_every_target() {
        let e = edges(&[
            ("a", Tag::Default, 2),
            ("a", Tag::symbol("x"), 3),
            ("b", Tag::Default, 1),
        ]);
        let out = TagQuery::Always.evaluate(&e);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, Token::text("a"));
        assert_eq!(out[0].score, 0);
        assert_eq!(out[1].target, Token::text("b"));
    }

    #[test]
    fn test_tag_filter() {
        let e = edges(&[("a", Tag::symbol("x"), 2), ("b", Tag::symbol("y"), 4)]);
        let out = TagQuery::tag("x").evaluate(&e);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Token::text("a"));

        let out = TagQuery::not(TagQuery::tag("x")).evaluate(&e);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Token::text("b"));

        let out = TagQuery::or(TagQuery::tag("x"), TagQuery::tag("y")).evaluate(&e);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_and() {
        let q = TagQuery::and(TagQuery::Always, TagQuery::not(TagQuery::tag("x")));
        assert!(q.matches(&Tag::symbol("y")));
        assert!(!q.matches(&Tag::symbol("x")));
    }

    #[test]
    fn test_score_uses_all_stored_tags() {
        let e = edges(&[
            ("a", Tag::Default, 1),
            ("a", Tag::symbol("x"), 1),
            ("b", Tag::Default, 2),
        ]);
        // Base only matches the default tag, but `a` also carries :x
        let q = TagQuery::score(
            TagQuery::tag(Tag::Default),
            vec![(TagQuery::tag("x"), 2), (TagQuery::tag("z"), 10)],
        );
        let out = q.evaluate(&e);
        assert_eq!(out[0].target, Token::text("a"));
        assert_eq!(out[0].score, 2);
        assert_eq!(out[1].score, 0);
    }

    #[test]
    fn test_score_saturates() {
        let e = edges(&[("a", Tag::symbol("x"), 1)]);
        let q = TagQuery::score(
            TagQuery::Always,
            vec![(TagQuery::tag("x"), u64::MAX / 2 + 1), (TagQuery::Always, u64::MAX / 2 + 1)],
        );
        let out = q.evaluate(&e);
        assert_eq!(out[0].score, u64::MAX);
    }

    #[test]
    fn test_nested_score_rejected() {
        let nested = TagQuery::not(TagQuery::score(TagQuery::Always, vec![]));
        assert!(matches!(
            nested.validate(),
            Err(ChainError::InvalidQuery { .. })
        ));
        let sub = TagQuery::score(
            TagQuery::Always,
            vec![(TagQuery::score(TagQuery::Always, vec![]), 1)],
        );
        assert!(sub.validate().is_err());
        assert!(TagQuery::score(TagQuery::Always, vec![(TagQuery::tag("x"), 1)])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let q = TagQuery::score(TagQuery::Always, vec![(TagQuery::tag("x"), 1)]);
        let json = serde_json::to_string(&q).unwrap();
        let back: TagQuery = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
    }
}
