//! Shape validation and mask helpers for candle tensors.
//!
//! The loss functions fail fast on malformed inputs; these helpers produce
//! the [`ProtDiffError::Shape`] errors they return.

use candle_core::{DType, Tensor};

use crate::{ProtDiffError, Result};

/// Check the tensor rank.
pub fn ensure_rank(t: &Tensor, rank: usize, op: &'static str) -> Result<()> {
    if t.rank() != rank {
        return Err(ProtDiffError::shape(op, format!("rank {rank}"), t.dims()));
    }
    Ok(())
}

/// Check that `t` has exactly the dims in `expected`.
pub fn ensure_dims(t: &Tensor, expected: &[usize], op: &'static str) -> Result<()> {
    if t.dims() != expected {
        return Err(ProtDiffError::shape(op, format!("{expected:?}"), t.dims()));
    }
    Ok(())
}

/// Check that `t` matches `expected` on every axis except the last.
pub fn ensure_leading_dims(t: &Tensor, expected: &[usize], op: &'static str) -> Result<()> {
    let dims = t.dims();
    if dims.len() != expected.len() + 1 || &dims[..expected.len()] != expected {
        return Err(ProtDiffError::shape(op, format!("{expected:?} + [V]"), dims));
    }
    Ok(())
}

/// Convert any numeric mask (bool-as-u8, 0/1 floats, ...) to a `U8` mask.
pub fn bool_mask(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.ne(0f64)?)
}

/// Flat indices of the non-zero entries of `mask`, in row-major order.
pub fn mask_indices(mask: &Tensor) -> Result<Vec<u32>> {
    let flags = bool_mask(mask)?.flatten_all()?.to_vec1::<u8>()?;
    Ok(flags.iter().enumerate().filter(|&(_, &f)| f != 0).map(|(i, _)| i as u32).collect())
}

/// Number of non-zero mask entries along the last axis.
///
/// `mask` of shape `(N, L)` gives `N` counts, `(N, D, L)` gives `N * D`
/// counts in row-major order.
pub fn row_counts(mask: &Tensor) -> Result<Vec<u32>> {
    let last = mask.rank().checked_sub(1).ok_or_else(|| {
        ProtDiffError::shape("row_counts", "rank >= 1", mask.dims())
    })?;
    let counts = bool_mask(mask)?.to_dtype(DType::U32)?.sum(last)?;
    Ok(counts.flatten_all()?.to_vec1::<u32>()?)
}

/// Token tensors may arrive as `U8`, `U32` or `I64`; gather needs `U32`.
pub fn token_ids(tokens: &Tensor) -> Result<Tensor> {
    match tokens.dtype() {
        DType::U32 => Ok(tokens.clone()),
        DType::U8 | DType::I64 => Ok(tokens.to_dtype(DType::U32)?),
        other => Err(ProtDiffError::InvalidArgument(format!(
            "token tensor must be integer typed, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn ensure_dims_reports_actual_shape() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(ensure_dims(&t, &[2, 3], "test").is_ok());
        let err = ensure_dims(&t, &[3, 2], "test").unwrap_err();
        assert!(err.to_string().contains("[2, 3]"));
    }

    #[test]
    fn leading_dims_ignore_vocab_axis() {
        let t = Tensor::zeros((2, 3, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(ensure_leading_dims(&t, &[2, 3], "test").is_ok());
        assert!(ensure_leading_dims(&t, &[2, 4], "test").is_err());
        assert!(ensure_leading_dims(&t, &[2], "test").is_err());
    }

    #[test]
    fn mask_indices_are_row_major() {
        let mask = Tensor::new(&[[1u8, 0, 1], [0, 0, 1]], &Device::Cpu).unwrap();
        assert_eq!(mask_indices(&mask).unwrap(), vec![0, 2, 5]);
    }

    #[test]
    fn float_masks_are_accepted() {
        let mask = Tensor::new(&[[1f32, 1.0, 0.0], [1.0, 0.0, 0.0]], &Device::Cpu).unwrap();
        assert_eq!(row_counts(&mask).unwrap(), vec![2, 1]);
    }

    #[test]
    fn token_ids_reject_floats() {
        let t = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        assert!(token_ids(&t).is_err());
        let t = Tensor::new(&[1i64, 2], &Device::Cpu).unwrap();
        assert_eq!(token_ids(&t).unwrap().to_vec1::<u32>().unwrap(), vec![1, 2]);
    }
}
