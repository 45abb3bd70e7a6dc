//! The sampling loop that turns a test set into a corpus perplexity.

use std::path::Path;
use std::time::Instant;

use protdiff_common::{EvalConfig, ProtDiffError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulator::PerplexityAccumulator;
use crate::collate::Collater;
use crate::model::SequenceModel;
use crate::perplexity::{NllRecord, sum_nll};
use crate::scheme::NoisingScheme;

/// Random-access test set.
pub trait SequenceSource {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<String>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SequenceSource for [String] {
    fn len(&self) -> usize {
        <[String]>::len(self)
    }

    fn get(&self, index: usize) -> Result<String> {
        <[String]>::get(self, index).cloned().ok_or_else(|| {
            ProtDiffError::InvalidArgument(format!("sequence index {index} out of range"))
        })
    }
}

impl SequenceSource for Vec<String> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn get(&self, index: usize) -> Result<String> {
        SequenceSource::get(self.as_slice(), index)
    }
}

/// Evaluation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub scheme: NoisingScheme,
    pub samples_evaluated: usize,
    pub total_tokens: usize,
    pub nll_sum: f64,
    pub skipped_nan: usize,
    pub mean_log_likelihood: f64,
    pub perplexity: f64,
    pub elapsed_ms: f64,
    /// Accepted records in evaluation order.
    pub records: Vec<NllRecord>,
}

impl EvalReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Results saved to: {}", path.display());
        Ok(())
    }
}

/// Samples sequences with replacement and accumulates their NLL.
#[derive(Debug, Clone)]
pub struct PerplexityRunner {
    config: EvalConfig,
}

impl PerplexityRunner {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Draw `num_samples` sequences from `data`, score each under the
    /// collator's scheme and report the corpus perplexity.
    pub fn run<M, C, S>(&self, model: &M, collater: &C, data: &S) -> Result<EvalReport>
    where
        M: SequenceModel + ?Sized,
        C: Collater + ?Sized,
        S: SequenceSource + ?Sized,
    {
        self.config.validate()?;
        if data.is_empty() {
            return Err(ProtDiffError::EmptyDataset);
        }
        let scheme = collater.scheme();
        let start = Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut acc = PerplexityAccumulator::new();
        let mut records = Vec::new();
        info!(%scheme, samples = self.config.num_samples, sequences = data.len(), "Starting perplexity evaluation");

        for i in 0..self.config.num_samples {
            let index = rng.gen_range(0..data.len());
            let sequence: String = data.get(index)?.chars().take(self.config.max_len).collect();
            let batch = collater.collate(&[sequence], &mut rng)?;
            for record in sum_nll(model, &batch, collater.tokenizer(), &self.config)? {
                if acc.push_record(&record) {
                    records.push(record);
                }
            }
            debug!(sample = i, index, "scored sequence");

            if i % self.config.report_every == 0 {
                info!(
                    sample = i,
                    perplexity = acc.perplexity(),
                    skipped = acc.skipped(),
                    "Progress: {}/{} samples",
                    i + 1,
                    self.config.num_samples
                );
            }
        }

        let report = EvalReport {
            scheme,
            samples_evaluated: self.config.num_samples,
            total_tokens: acc.token_sum(),
            nll_sum: acc.loss_sum(),
            skipped_nan: acc.skipped(),
            mean_log_likelihood: acc.mean_log_likelihood(),
            perplexity: acc.perplexity(),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            records,
        };
        info!(perplexity = report.perplexity, skipped = report.skipped_nan, "Final test perplexity");
        Ok(report)
    }
}
