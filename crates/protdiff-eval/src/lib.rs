//! Perplexity evaluation for protein sequence models.
//!
//! The driver samples sequences from a test set, noises them with the
//! collator of the model's scheme, runs the model and converts its output
//! into `(time, loss, tokens)` records. A [`PerplexityAccumulator`] folds the
//! records into a corpus perplexity, skipping (and counting) `NaN` losses.

pub mod accumulator;
pub mod collate;
pub mod model;
pub mod perplexity;
pub mod runner;
pub mod scheme;

pub use accumulator::PerplexityAccumulator;
pub use collate::{CausalMaskCollater, Collater, D3pmCollater, OaMaskCollater};
pub use model::{ModelOutput, SequenceModel};
pub use perplexity::{NllRecord, sum_nll};
pub use runner::{EvalReport, PerplexityRunner, SequenceSource};
pub use scheme::{CollatedBatch, NoisingScheme};
