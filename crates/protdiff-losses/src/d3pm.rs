//! Padding-aware reconstruction cross-entropy for D3PM models.
//!
//! Used on its own as the `t = 1` term of the variational bound. Logits are
//! sliced to the amino-acid block before the softmax and the mean is taken
//! over every non-padding position of the batch.

use candle_core::{DType, Tensor};
use protdiff_common::tensor::{ensure_leading_dims, ensure_rank};
use protdiff_common::{ProteinTokenizer, Result};

use crate::ops::{ce_row_sums, slice_vocab};

/// Reconstruction loss over `(N, L, V)` predictions.
#[derive(Debug, Clone, Default)]
pub struct D3pmCeLoss {
    tokenizer: ProteinTokenizer,
}

impl D3pmCeLoss {
    pub fn new(tokenizer: ProteinTokenizer) -> Self {
        Self { tokenizer }
    }

    /// Mean cross-entropy over the non-padding positions, as an `F64` scalar.
    ///
    /// A batch with no non-padding positions yields `NaN`.
    pub fn forward(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<Tensor> {
        ensure_rank(tgt, 2, "d3pm_ce target")?;
        let (sums, counts) = self.row_sums(pred, tgt, input_mask)?;
        Ok((sums.sum_all()? / counts.sum_all()?)?)
    }

    /// Mean cross-entropy of each sequence, `(N,)` `F64`.
    pub fn per_sequence(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<Tensor> {
        let (sums, counts) = self.row_sums(pred, tgt, input_mask)?;
        Ok((sums / counts)?)
    }

    fn row_sums(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure_leading_dims(pred, tgt.dims(), "d3pm_ce prediction")?;
        let p = slice_vocab(pred, self.tokenizer.all_aas_len())?;
        ce_row_sums(&p, tgt, input_mask)
    }
}

/// Reconstruction loss over `(N, depth, L, V)` alignment predictions.
#[derive(Debug, Clone, Default)]
pub struct D3pmCeLossMsa {
    tokenizer: ProteinTokenizer,
}

impl D3pmCeLossMsa {
    pub fn new(tokenizer: ProteinTokenizer) -> Self {
        Self { tokenizer }
    }

    /// Mean cross-entropy over every non-padding position of every row of
    /// every alignment, as an `F64` scalar.
    pub fn forward(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<Tensor> {
        let (sums, counts) = self.row_sums(pred, tgt, input_mask)?;
        Ok((sums.sum_all()? / counts.sum_all()?)?)
    }

    /// Mean cross-entropy of each alignment, `(N,)` `F64`.
    pub fn per_alignment(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<Tensor> {
        let (sums, counts) = self.row_sums(pred, tgt, input_mask)?;
        Ok((sums / counts)?)
    }

    fn row_sums(&self, pred: &Tensor, tgt: &Tensor, input_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure_rank(tgt, 3, "d3pm_ce_msa target")?;
        ensure_leading_dims(pred, tgt.dims(), "d3pm_ce_msa prediction")?;
        let (n, depth, l) = tgt.dims3()?;
        let p = slice_vocab(pred, self.tokenizer.all_aas_len())?;
        let k = p.dim(3)?;
        ce_row_sums(
            &p.reshape((n, depth * l, k))?,
            &tgt.reshape((n, depth * l))?,
            &input_mask.reshape((n, depth * l))?,
        )
    }
}

/// `F64` scalar helper for callers that want a plain number.
pub fn scalar_value(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
