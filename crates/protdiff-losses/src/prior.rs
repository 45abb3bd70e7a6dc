//! Stationary prior of the diffusion chain.

use candle_core::{DType, Device, Tensor};
use protdiff_common::{ProtDiffError, Result};

/// Uniform `(rows, cols)` distribution, every entry `1 / vocab_size`.
///
/// This is the distribution the forward process converges to as `t -> inf`
/// and the reference for the `t = T_max` KL term.
pub fn sample_prior(rows: usize, cols: usize, vocab_size: usize, device: &Device) -> Result<Tensor> {
    let value = uniform_mass(vocab_size)?;
    Ok(Tensor::full(value, (rows, cols), device)?)
}

/// Three-axis variant of [`sample_prior`], used for alignments.
pub fn sample_prior_3d(
    a: usize,
    b: usize,
    c: usize,
    vocab_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let value = uniform_mass(vocab_size)?;
    Ok(Tensor::full(value, (a, b, c), device)?)
}

fn uniform_mass(vocab_size: usize) -> Result<f64> {
    if vocab_size == 0 {
        return Err(ProtDiffError::InvalidArgument("prior vocabulary size must be > 0".into()));
    }
    Ok(1.0 / vocab_size as f64)
}

/// dtype of every prior tensor.
pub const PRIOR_DTYPE: DType = DType::F64;
