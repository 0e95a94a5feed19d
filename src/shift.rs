/// Probability shifting.
///
/// Re-weights one context's candidates along a single peaked curve so that
/// the few most frequent targets stop dominating every draw. The curve is
/// computed on the rank order of the weights:
///
/// ```text
///  weight
///    ^          peak
///    |           *
///    |        *     *
///    |     *           *
///    |  *                  *  *  *  lowest
///    +------------------------------> rank
///    0        peak_index          n-1
/// ```
///
/// Ranks before the peak rise from `peak / ratio` to `peak`, the peak keeps
/// its own weight, and ranks after it decay by an inverse power law down to
/// the lowest observed weight. Relative order inside each side of the curve
/// is preserved.
use serde::{Deserialize, Serialize};

/// Constants of the shifting curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftCurve {
    /// Steepness of both sides of the curve
    pub exponent: f64,
    /// Peak position as a fraction of `sqrt(n)`
    pub peak_fraction: f64,
    /// Upper bound on `first / peak`
    pub ratio_cap: f64,
}

impl Default for ShiftCurve {
    fn default() -> Self {
        Self {
            exponent: 1.7,
            peak_fraction: 0.1,
            ratio_cap: 5.0,
        }
    }
}

impl ShiftCurve {
    /// Index of the peak for `n` candidates.
    pub fn peak_index(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let min_allowed = if n == 1 { 0 } else { 1 };
        let raw = ((n as f64).sqrt() * self.peak_fraction).floor() as usize;
        raw.max(min_allowed).min(n - 1)
    }

    /// Replacement weights for `weights` already sorted in descending order.
    pub fn curve(&self, sorted: &[u64]) -> Vec<u64> {
        let n = sorted.len();
        if n == 0 {
            return Vec::new();
        }

        let p = self.peak_index(n);
        let peak = sorted[p] as f64;
        let first = sorted[0] as f64;
        let last = sorted[n - 1] as f64;
        let ratio = if peak > 0.0 {
            (first / peak).min(self.ratio_cap).max(1.0)
        } else {
            1.0
        };
        let offset = peak / ratio;

        // Tail decay normalised so the last rank lands on `last`
        let decay = |i: usize| ((i - p + 1) as f64).powf(-self.exponent);
        let tail_floor = decay(n - 1);

        (0..n)
            .map(|i| {
                let value = if i < p {
                    let t = i as f64 / p as f64;
                    offset + (peak - offset) * t.powf(self.exponent)
                } else if i == p {
                    peak
                } else {
                    let span = 1.0 - tail_floor;
                    let f = if span > 0.0 {
                        (decay(i) - tail_floor) / span
                    } else {
                        0.0
                    };
                    last + (peak - last) * f
                };
                value.round().max(0.0) as u64
            })
            .collect()
    }

    /// Shift a `(item, weight)` distribution.
    ///
    /// Items come back in descending order of their original weight. If every
    /// replacement rounds to zero the original weights are kept.
    pub fn apply<T>(&self, mut items: Vec<(T, u64)>) -> Vec<(T, u64)> {
        items.sort_by(|a, b| b.1.cmp(&a.1));
        let sorted: Vec<u64> = items.iter().map(|(_, w)| *w).collect();
        let shifted = self.curve(&sorted);
        if shifted.iter().all(|w| *w == 0) {
            return items;
        }
        items
            .into_iter()
            .zip(shifted)
            .map(|((item, _), w)| (item, w))
            .collect()
    }
}
