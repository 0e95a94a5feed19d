/// Training windows and weighted next-token selection.
///
/// Training slides a window of `order` tokens over the input, padded with
/// `order` copies of `Start` in front and a single `End` at the back, and
/// emits one `(context, target)` pair per position. Generation walks the same
/// windows forwards, drawing each target in proportion to its weight.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ChainError, ChainResult};
use crate::query::TagQuery;
use crate::shift::ShiftCurve;
use crate::storage::ContextEdges;
use crate::types::{sanitize, Context, Tag, Token};

/// Default cap on generated tokens, `End` included.
pub const DEFAULT_STEP_LIMIT: usize = 1000;

/// A training call, as queued while the model is resharding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Token sequence to learn
    pub tokens: Vec<Token>,
    /// Tags to record every window under; empty means `Tag::Default`
    pub tags: Vec<Tag>,
}

impl TrainRequest {
    /// The tags edges are recorded under.
    pub fn effective_tags(&self) -> Vec<Tag> {
        if self.tags.is_empty() {
            vec![Tag::Default]
        } else {
            self.tags.clone()
        }
    }
}

/// Prepare a token for use inside a context.
pub fn context_token(token: &Token, sanitize_tokens: bool) -> Token {
    if sanitize_tokens {
        sanitize(token)
    } else {
        token.clone()
    }
}

/// Every `(context, target)` window of `tokens`.
///
/// Contexts are built from sanitized tokens when `sanitize_tokens` is set;
/// targets keep their original form.
pub fn windows(order: usize, tokens: &[Token], sanitize_tokens: bool) -> Vec<(Context, Token)> {
    let mut context = Context::start(order);
    let mut out = Vec::with_capacity(tokens.len() + 1);
    for token in tokens {
        out.push((context.clone(), token.clone()));
        context.slide(context_token(token, sanitize_tokens));
    }
    out.push((context, Token::End));
    out
}

/// Candidate targets of one context with their final draw weights.
///
/// Edge weights are summed per target and, if a shifter is given, reshaped
/// across every target of the context. The query then decides which targets
/// take part and scales each by `score + 1`.
pub fn candidates(edges: &ContextEdges, query: &TagQuery, shift: Option<&ShiftCurve>) -> Vec<(Token, u64)> {
    let mut totals: BTreeMap<&Token, u64> = BTreeMap::new();
    for ((target, _), weight) in edges {
        let total = totals.entry(target).or_default();
        *total = total.saturating_add(*weight);
    }
    if let Some(curve) = shift {
        totals = curve.apply(totals.into_iter().collect()).into_iter().collect();
    }

    query
        .evaluate(edges)
        .into_iter()
        .filter_map(|scored| {
            let weight = totals.get(&scored.target).copied()?;
            let weight = weight.saturating_mul(scored.score.saturating_add(1));
            (weight > 0).then_some((scored.target, weight))
        })
        .collect()
}

/// Draw one target in proportion to its weight.
///
/// Returns `None` if there are no candidates with positive weight. The total
/// is summed in `u128` so any number of `u64` weights fits.
pub fn choose<'a, R: Rng + ?Sized>(candidates: &'a [(Token, u64)], rng: &mut R) -> Option<&'a Token> {
    let total: u128 = candidates.iter().map(|(_, w)| u128::from(*w)).sum();
    if total == 0 {
        return None;
    }
    let mut point = rng.gen_range(0..total);
    for (target, weight) in candidates {
        let weight = u128::from(*weight);
        if point < weight {
            return Some(target);
        }
        point -= weight;
    }
    None
}

/// Reject caller tokens that collide with the `Start`/`End` padding.
pub fn check_tokens(tokens: &[Token]) -> ChainResult<()> {
    match tokens.iter().find(|token| token.is_sentinel()) {
        Some(token) => Err(ChainError::ReservedToken(token.clone())),
        None => Ok(()),
    }
}
