//! Per-sample negative log-likelihood under each noising scheme.

use candle_core::{DType, Tensor};
use protdiff_common::tensor::{ensure_dims, row_counts, token_ids};
use protdiff_common::{EvalConfig, Result, Tokenizer};
use protdiff_losses::OaMaskedCrossEntropyLoss;
use protdiff_losses::ops::{cross_entropy_rows, ensure_prediction, masked_cross_entropy, slice_vocab};
use serde::{Deserialize, Serialize};

use crate::model::SequenceModel;
use crate::scheme::CollatedBatch;

/// One `(time, loss, tokens)` observation.
///
/// `time` is the sampled diffusion step for D3PM models and the masked (or
/// scored) fraction of the sequence for the mask schemes. `loss` is a summed
/// NLL over `tokens` positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NllRecord {
    pub time: f64,
    pub loss: f64,
    pub tokens: usize,
}

/// Run `model` on `batch` and extract the NLL records of every sequence in
/// it.
///
/// * diffusion: summed cross-entropy over the whole target, one record per
///   sequence with `tokens = L` and `time = t`
/// * order-agnostic / external mask: unweighted masked cross-entropy over
///   the first `mask_vocab_limit` logits, `tokens` = masked positions,
///   `time = tokens / len` with `len` the row's non-padding length
/// * causal mask: one record per prefix length `k = 1..=n`, carrying the
///   summed loss of the first `k` scored positions and `time = k / n`
///
/// Non-finite losses are returned as-is; filtering them is the caller's job.
pub fn sum_nll<M: SequenceModel + ?Sized>(
    model: &M,
    batch: &CollatedBatch,
    tokenizer: &dyn Tokenizer,
    config: &EvalConfig,
) -> Result<Vec<NllRecord>> {
    match batch {
        CollatedBatch::Diffusion { src, timestep, tgt, .. } => {
            let logits = model.forward(src, timestep)?.into_logits()?;
            diffusion_nll(&logits, tgt, timestep)
        }
        CollatedBatch::OrderAgnosticMask { src, tgt, mask, .. } => {
            // OA-ARDM models ignore the timestep input
            let placeholder = Tensor::zeros(src.dim(0)?, DType::U32, src.device())?;
            let logits = model.forward(src, &placeholder)?.into_logits()?;
            masked_nll(&logits, src, tgt, mask, tokenizer, config)
        }
        CollatedBatch::ExternalMask { src, timestep, tgt, mask } => {
            let logits = model.forward(src, timestep)?.into_logits()?;
            masked_nll(&logits, src, tgt, mask, tokenizer, config)
        }
        CollatedBatch::CausalMask { src, tgt, mask } => {
            let placeholder = Tensor::zeros(src.dim(0)?, DType::U32, src.device())?;
            let logits = model.forward(src, &placeholder)?.into_logits()?;
            causal_nll(&logits, tgt, mask)
        }
    }
}

fn diffusion_nll(logits: &Tensor, tgt: &Tensor, timestep: &Tensor) -> Result<Vec<NllRecord>> {
    let (n, l) = tgt.dims2()?;
    ensure_prediction(logits, tgt, "diffusion logits")?;
    ensure_dims(timestep, &[n], "diffusion timestep")?;
    let v = logits.dim(2)?;

    let ce = cross_entropy_rows(&logits.reshape((n * l, v))?, &tgt.reshape(n * l)?)?;
    let sums = ce.to_dtype(DType::F64)?.reshape((n, l))?.sum(1)?.to_vec1::<f64>()?;
    let steps = token_ids(timestep)?.to_vec1::<u32>()?;
    Ok(sums
        .into_iter()
        .zip(steps)
        .map(|(loss, t)| NllRecord { time: t as f64, loss, tokens: l })
        .collect())
}

fn masked_nll(
    logits: &Tensor,
    src: &Tensor,
    tgt: &Tensor,
    mask: &Tensor,
    tokenizer: &dyn Tokenizer,
    config: &EvalConfig,
) -> Result<Vec<NllRecord>> {
    let n = tgt.dim(0)?;
    ensure_prediction(logits, tgt, "masked logits")?;
    let logits = slice_vocab(logits, config.mask_vocab_limit)?;
    let input_mask = src.ne(tokenizer.pad_token_id() as f64)?;
    let loss = OaMaskedCrossEntropyLoss::new(false);
    let unused_t = Tensor::zeros(1, DType::U32, src.device())?;
    let masked = row_counts(mask)?;
    let lengths = row_counts(&input_mask)?;

    let mut records = Vec::with_capacity(n);
    for (i, (&tokens, &len)) in masked.iter().zip(&lengths).enumerate() {
        let (_, nll) = loss.forward(
            &logits.narrow(0, i, 1)?,
            &tgt.narrow(0, i, 1)?,
            &mask.narrow(0, i, 1)?,
            &unused_t,
            &input_mask.narrow(0, i, 1)?,
        )?;
        records.push(NllRecord {
            time: tokens as f64 / len as f64,
            loss: nll.to_scalar::<f64>()?,
            tokens: tokens as usize,
        });
    }
    Ok(records)
}

fn causal_nll(logits: &Tensor, tgt: &Tensor, mask: &Tensor) -> Result<Vec<NllRecord>> {
    let (n, l) = tgt.dims2()?;
    let (ce, selected) = masked_cross_entropy(logits, tgt, mask)?;
    let ce = ce.to_dtype(DType::F64)?.to_vec1::<f64>()?;

    let mut per_row: Vec<Vec<f64>> = vec![Vec::new(); n];
    for (&idx, &loss) in selected.iter().zip(&ce) {
        per_row[idx as usize / l].push(loss);
    }

    let mut records = Vec::new();
    for losses in per_row {
        let total = losses.len();
        let mut prefix = 0.0;
        for (k, loss) in losses.into_iter().enumerate() {
            prefix += loss;
            records.push(NllRecord {
                time: (k + 1) as f64 / total as f64,
                loss: prefix,
                tokens: k + 1,
            });
        }
    }
    Ok(records)
}
