//! Streaming corpus perplexity.

use tracing::warn;

use crate::perplexity::NllRecord;

/// Running sums of summed NLL and scored tokens.
///
/// Records whose loss is `NaN` are skipped and counted rather than folded
/// in; some masked models are numerically unstable at high mask fractions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerplexityAccumulator {
    loss_sum: f64,
    token_sum: usize,
    accepted: usize,
    skipped: usize,
}

impl PerplexityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one `(loss, tokens)` pair. Returns `false` if it was skipped.
    pub fn push(&mut self, loss: f64, tokens: usize) -> bool {
        if loss.is_nan() {
            self.skipped += 1;
            warn!(tokens, skipped = self.skipped, "skipping NaN loss");
            return false;
        }
        self.loss_sum += loss;
        self.token_sum += tokens;
        self.accepted += 1;
        true
    }

    pub fn push_record(&mut self, record: &NllRecord) -> bool {
        self.push(record.loss, record.tokens)
    }

    pub fn loss_sum(&self) -> f64 {
        self.loss_sum
    }

    pub fn token_sum(&self) -> usize {
        self.token_sum
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Mean per-token log-likelihood, `-sum(loss) / sum(tokens)`.
    ///
    /// `NaN` until at least one token has been scored.
    pub fn mean_log_likelihood(&self) -> f64 {
        if self.token_sum == 0 {
            return f64::NAN;
        }
        -self.loss_sum / self.token_sum as f64
    }

    /// Corpus perplexity, `exp(sum(loss) / sum(tokens))`.
    ///
    /// `loss` is a negative log-likelihood, so this is the reciprocal of
    /// `exp(mean_log_likelihood())`, the per-token geometric-mean likelihood.
    pub fn perplexity(&self) -> f64 {
        (-self.mean_log_likelihood()).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_approx(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() < eps, "expected {a} ≈ {b} (eps={eps})");
    }

    #[test]
    fn nan_losses_are_skipped_and_counted() {
        let mut acc = PerplexityAccumulator::new();
        assert!(acc.push(2.0, 10));
        assert!(acc.push(3.0, 5));
        assert!(!acc.push(f64::NAN, 7));

        assert_eq!(acc.skipped(), 1);
        assert_eq!(acc.accepted(), 2);
        assert_eq!(acc.token_sum(), 15);
        assert_approx(acc.mean_log_likelihood(), -1.0 / 3.0, 1e-15);
        assert_approx(acc.perplexity(), (1.0f64 / 3.0).exp(), 1e-15);
    }

    #[test]
    fn perplexity_is_the_reciprocal_of_mean_likelihood() {
        let mut acc = PerplexityAccumulator::new();
        acc.push(2.0, 10);
        acc.push(3.0, 5);
        let likelihood = acc.mean_log_likelihood().exp();
        assert_approx(likelihood, (-1.0f64 / 3.0).exp(), 1e-15);
        assert_approx(acc.perplexity() * likelihood, 1.0, 1e-15);
    }

    #[test]
    fn empty_accumulator_has_no_perplexity() {
        let acc = PerplexityAccumulator::new();
        assert!(acc.mean_log_likelihood().is_nan());
        assert!(acc.perplexity().is_nan());
    }

    #[test]
    fn records_feed_the_same_sums() {
        let mut acc = PerplexityAccumulator::new();
        acc.push_record(&NllRecord { time: 0.5, loss: 4.0, tokens: 2 });
        assert_approx(acc.perplexity(), 2f64.exp(), 1e-12);
    }

    proptest! {
        #[test]
        fn sums_ignore_nan_entries(
            pairs in prop::collection::vec((0.0f64..50.0, 1usize..100, any::<bool>()), 1..40)
        ) {
            let mut acc = PerplexityAccumulator::new();
            let (mut loss, mut tokens, mut nans) = (0.0, 0usize, 0usize);
            for &(l, t, is_nan) in &pairs {
                if is_nan {
                    acc.push(f64::NAN, t);
                    nans += 1;
                } else {
                    acc.push(l, t);
                    loss += l;
                    tokens += t;
                }
            }
            prop_assert_eq!(acc.skipped(), nans);
            prop_assert_eq!(acc.token_sum(), tokens);
            if tokens > 0 {
                prop_assert!((acc.mean_log_likelihood() + loss / tokens as f64).abs() < 1e-9);
            }
        }
    }
}
