//! Tensor building blocks shared by the loss objects.

use candle_core::{D, DType, Tensor};
use candle_nn::ops::log_softmax;
use protdiff_common::tensor::{bool_mask, ensure_dims, ensure_leading_dims, mask_indices, token_ids};
use protdiff_common::{ProtDiffError, Result};

/// Keep the first `k` entries of the trailing vocabulary axis.
///
/// Model heads may emit special tokens after the amino acids; these must
/// never reach a softmax that is compared against an amino-acid posterior.
pub fn slice_vocab(pred: &Tensor, k: usize) -> Result<Tensor> {
    let v = pred.dim(D::Minus1)?;
    if v < k {
        return Err(ProtDiffError::shape("slice_vocab", format!("vocab axis >= {k}"), pred.dims()));
    }
    Ok(pred.narrow(D::Minus1, 0, k)?)
}

fn check_targets(targets: &Tensor, vocab: usize) -> Result<()> {
    let values = targets.flatten_all()?.to_vec1::<u32>()?;
    if let Some(&bad) = values.iter().find(|&&t| t as usize >= vocab) {
        return Err(ProtDiffError::InvalidToken { token: bad, vocab });
    }
    Ok(())
}

/// Per-row cross-entropy of `(M, V)` logits against `(M,)` class indices.
///
/// Returns `(M,)` in the logits dtype.
pub fn cross_entropy_rows(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (m, v) = logits.dims2()?;
    // gather needs contiguous indices; narrowed target columns are strided
    let targets = token_ids(targets)?.contiguous()?;
    ensure_dims(&targets, &[m], "cross_entropy_rows")?;
    check_targets(&targets, v)?;
    if m == 0 {
        return Ok(Tensor::zeros(0, logits.dtype(), logits.device())?);
    }
    let logp = log_softmax(logits, D::Minus1)?;
    Ok(logp.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?)
}

/// Cross-entropy at the masked positions of a `(N, L, V)` prediction.
///
/// Returns the per-position losses (row-major order of the selected
/// positions) and the flat `N * L` index of each selected position.
pub fn masked_cross_entropy(
    pred: &Tensor,
    tgt: &Tensor,
    mask: &Tensor,
) -> Result<(Tensor, Vec<u32>)> {
    let (n, l, v) = pred.dims3()?;
    ensure_dims(tgt, &[n, l], "masked_cross_entropy target")?;
    ensure_dims(mask, &[n, l], "masked_cross_entropy mask")?;

    let selected = mask_indices(mask)?;
    let index = Tensor::from_vec(selected.clone(), selected.len(), pred.device())?;
    let p = pred.reshape((n * l, v))?.index_select(&index, 0)?;
    let t = token_ids(tgt)?.reshape(n * l)?.index_select(&index, 0)?;
    Ok((cross_entropy_rows(&p, &t)?, selected))
}

/// Summed cross-entropy and token count per row over the masked positions.
///
/// `logits` is `(R, P, V)`, `tgt` and `mask` are `(R, P)`. Targets at
/// unmasked positions are ignored (they may hold padding ids outside the
/// vocabulary). Both outputs are `(R,)` `F64`.
pub fn ce_row_sums(logits: &Tensor, tgt: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let (r, p, v) = logits.dims3()?;
    ensure_dims(tgt, &[r, p], "ce_row_sums target")?;
    ensure_dims(mask, &[r, p], "ce_row_sums mask")?;

    let keep = bool_mask(mask)?;
    let tgt = token_ids(tgt)?;
    let safe_tgt = keep.where_cond(&tgt, &tgt.zeros_like()?)?.contiguous()?;
    check_targets(&safe_tgt, v)?;

    let logp = log_softmax(logits, D::Minus1)?;
    let ce = logp.gather(&safe_tgt.unsqueeze(2)?, 2)?.squeeze(2)?.neg()?.to_dtype(DType::F64)?;
    let weight = keep.to_dtype(DType::F64)?;
    Ok(((ce * &weight)?.sum(1)?, weight.sum(1)?))
}

/// Pointwise `target * (ln target - log_input)` where `valid` is set and
/// `target > 0`, zero elsewhere.
///
/// `log_input` must already be in log-space. Zero-probability targets
/// contribute nothing, matching the `0 * ln 0 = 0` convention. All three
/// tensors share one shape.
pub fn kl_div_pointwise(log_input: &Tensor, target: &Tensor, valid: &Tensor) -> Result<Tensor> {
    ensure_dims(target, log_input.dims(), "kl_div target")?;
    ensure_dims(valid, log_input.dims(), "kl_div valid mask")?;
    let target = target.to_dtype(DType::F64)?;
    let log_input = log_input.to_dtype(DType::F64)?;

    let keep = (bool_mask(valid)? * target.gt(0f64)?)?;
    let term = (&target * (target.log()? - log_input)?)?;
    Ok(keep.where_cond(&term, &term.zeros_like()?)?)
}

/// Column mask `(R, L)` with `mask[r, l] = l < lengths[r]`.
pub fn length_mask(lengths: &[u32], l: usize, device: &candle_core::Device) -> Result<Tensor> {
    let cols = Tensor::arange(0u32, l as u32, device)?.unsqueeze(0)?;
    let lens = Tensor::from_slice(lengths, (lengths.len(), 1), device)?;
    Ok(cols.broadcast_lt(&lens)?)
}

/// Require a `(N, L, V)` tensor whose leading axes match `tgt`.
pub fn ensure_prediction(pred: &Tensor, tgt: &Tensor, op: &'static str) -> Result<()> {
    ensure_leading_dims(pred, tgt.dims(), op)
}
