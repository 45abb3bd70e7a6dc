//! Order-agnostic masked cross-entropy.

use candle_core::{DType, Tensor};
use protdiff_common::tensor::{ensure_dims, row_counts};
use protdiff_common::{LossConfig, ProtDiffError, Result};

use crate::ops::masked_cross_entropy;

/// Cross-entropy at the masked positions of a batch, with the OA-ARDM
/// reweighting of Hoogeboom et al.
///
/// With reweighting enabled every masked position of sequence `i`
/// contributes `nonpad_i / t_i * ce`, where `nonpad_i` is the number of
/// non-padding tokens and `t_i` the number of masked positions drawn for
/// that sequence. The expected gradient magnitude is then independent of
/// how many positions were masked.
#[derive(Debug, Clone)]
pub struct OaMaskedCrossEntropyLoss {
    reweight: bool,
}

impl Default for OaMaskedCrossEntropyLoss {
    fn default() -> Self {
        Self { reweight: true }
    }
}

impl OaMaskedCrossEntropyLoss {
    pub fn new(reweight: bool) -> Self {
        Self { reweight }
    }

    pub fn from_config(config: &LossConfig) -> Self {
        Self::new(config.reweight)
    }

    pub fn reweight(&self) -> bool {
        self.reweight
    }

    /// Compute `(training_loss, nll)`.
    ///
    /// * `pred` - `(N, L, V)` logits
    /// * `tgt` - `(N, L)` token ids
    /// * `mask` - `(N, L)`, non-zero at the positions to score
    /// * `timesteps` - `(N,)` masked-position count per sequence
    /// * `input_mask` - `(N, L)`, non-zero at non-padding positions
    ///
    /// Both outputs are `F64` scalars. `nll` is the unweighted sum of the
    /// per-position cross-entropy; without reweighting the two are equal.
    pub fn forward(
        &self,
        pred: &Tensor,
        tgt: &Tensor,
        mask: &Tensor,
        timesteps: &Tensor,
        input_mask: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (n, l, _) = pred.dims3()?;
        ensure_dims(input_mask, &[n, l], "oa_masked_ce input mask")?;
        ensure_dims(timesteps, &[n], "oa_masked_ce timesteps")?;

        let (loss, selected) = masked_cross_entropy(pred, tgt, mask)?;
        let loss = loss.to_dtype(DType::F64)?;
        let nll = loss.sum_all()?;
        if !self.reweight {
            return Ok((nll.clone(), nll));
        }

        let t = timesteps.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        let nonpad = row_counts(input_mask)?;
        check_timesteps(&t, &row_counts(mask)?, selected.len())?;

        let weights: Vec<f64> = selected
            .iter()
            .map(|&idx| {
                let row = idx as usize / l;
                nonpad[row] as f64 / t[row]
            })
            .collect();
        let weights = Tensor::from_vec(weights, selected.len(), pred.device())?;
        let ce = (loss * weights)?.sum_all()?;
        Ok((ce, nll))
    }
}

/// The `1/t` weights are only meaningful when each sequence's timestep is
/// its masked-position count.
fn check_timesteps(t: &[f64], masked: &[u32], total: usize) -> Result<()> {
    let sum: f64 = t.iter().sum();
    if sum != total as f64 {
        return Err(ProtDiffError::InvalidArgument(format!(
            "timesteps sum to {sum} but {total} positions are masked"
        )));
    }
    for (i, (&ti, &m)) in t.iter().zip(masked).enumerate() {
        if m > 0 && ti <= 0.0 {
            return Err(ProtDiffError::InvalidArgument(format!(
                "sequence {i} has {m} masked positions but timestep {ti}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn assert_approx(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() < eps, "expected {a} ≈ {b} (eps={eps})");
    }

    fn scalar(t: &Tensor) -> f64 {
        t.to_scalar::<f64>().unwrap()
    }

    #[test]
    fn unweighted_loss_equals_nll() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[[[2f32, 0.0, -1.0], [0.5, 0.5, 0.0]]], &dev).unwrap();
        let tgt = Tensor::new(&[[0u32, 2]], &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 1]], &dev).unwrap();
        let t = Tensor::new(&[2u32], &dev).unwrap();
        let input_mask = Tensor::new(&[[1u8, 1]], &dev).unwrap();

        let (ce, nll) = OaMaskedCrossEntropyLoss::new(false)
            .forward(&pred, &tgt, &mask, &t, &input_mask)
            .unwrap();
        assert_eq!(ce.dtype(), DType::F64);
        assert_eq!(scalar(&ce), scalar(&nll));
    }

    #[test]
    fn weights_follow_row_membership() {
        let dev = Device::Cpu;
        // uniform logits: every position costs ln 4
        let pred = Tensor::zeros((2, 3, 4), DType::F32, &dev).unwrap();
        let tgt = Tensor::zeros((2, 3), DType::U32, &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0], [0, 0, 1]], &dev).unwrap();
        let t = Tensor::new(&[2u32, 1], &dev).unwrap();
        let input_mask = Tensor::new(&[[1u8, 1, 1], [1, 1, 0]], &dev).unwrap();

        let (ce, nll) = OaMaskedCrossEntropyLoss::new(true)
            .forward(&pred, &tgt, &mask, &t, &input_mask)
            .unwrap();
        let ln4 = 4f64.ln();
        assert_approx(scalar(&nll), 3.0 * ln4, 1e-6);
        // row 0: 2 positions * 3/2, row 1: 1 position * 2/1
        assert_approx(scalar(&ce), (3.0 + 2.0) * ln4, 1e-6);
    }

    #[test]
    fn mismatched_timesteps_are_rejected() {
        let dev = Device::Cpu;
        let pred = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        let tgt = Tensor::zeros((1, 2), DType::U32, &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 1]], &dev).unwrap();
        let input_mask = Tensor::new(&[[1u8, 1]], &dev).unwrap();
        let loss = OaMaskedCrossEntropyLoss::default();

        let t = Tensor::new(&[1u32], &dev).unwrap();
        assert!(loss.forward(&pred, &tgt, &mask, &t, &input_mask).is_err());
        // the unweighted path never reads the timesteps
        assert!(OaMaskedCrossEntropyLoss::new(false)
            .forward(&pred, &tgt, &mask, &t, &input_mask)
            .is_ok());
    }

    #[test]
    fn shape_mismatch_fails_fast() {
        let dev = Device::Cpu;
        let pred = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        let tgt = Tensor::zeros((1, 3), DType::U32, &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 1]], &dev).unwrap();
        let t = Tensor::new(&[2u32], &dev).unwrap();
        let err = OaMaskedCrossEntropyLoss::default()
            .forward(&pred, &tgt, &mask, &t, &mask)
            .unwrap_err();
        assert!(matches!(err, ProtDiffError::Shape { .. }));
    }
}
