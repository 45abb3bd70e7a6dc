//! D3PM transition kernels.
//!
//! `q[t]` is the single-step kernel `Q_t` and `q_bar[t]` the cumulative
//! kernel `Q_1 Q_2 ... Q_t`, both `(K, K)` row-stochastic matrices stored in
//! `F64`. Index 0 holds the identity so that `q_bar[t - 1]` is valid for
//! every `t >= 1`.

use candle_core::{D, DType, Device, IndexOp, Tensor};
use protdiff_common::tensor::ensure_dims;
use protdiff_common::{ProtDiffError, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TransitionMatrices {
    q: Tensor,
    q_bar: Tensor,
    tmax: usize,
    k: usize,
}

impl TransitionMatrices {
    /// Uniform-noise schedule with `beta_t = 1 / (tmax - t + 1)`.
    ///
    /// `Q_t = (1 - beta_t) I + beta_t / K`. At `t = tmax` the kernel is fully
    /// uniform, so `q_bar[tmax]` equals the stationary prior.
    pub fn uniform(k: usize, tmax: usize, device: &Device) -> Result<Self> {
        if k == 0 || tmax == 0 {
            return Err(ProtDiffError::InvalidArgument(format!(
                "transition schedule needs k > 0 and tmax > 0, got k={k} tmax={tmax}"
            )));
        }
        let eye = Tensor::eye(k, DType::F64, device)?;
        let mut q = Vec::with_capacity(tmax + 1);
        let mut q_bar = Vec::with_capacity(tmax + 1);
        q.push(eye.clone());
        q_bar.push(eye.clone());
        for t in 1..=tmax {
            let beta = 1.0 / (tmax - t + 1) as f64;
            let q_t = eye.affine(1.0 - beta, beta / k as f64)?;
            let cumulative = q_bar[t - 1].matmul(&q_t)?;
            q.push(q_t);
            q_bar.push(cumulative);
        }
        debug!(k, tmax, "built uniform transition schedule");
        Ok(Self { q: Tensor::stack(&q, 0)?, q_bar: Tensor::stack(&q_bar, 0)?, tmax, k })
    }

    /// Identity kernels at every step; the forward process leaves tokens
    /// untouched.
    pub fn identity(k: usize, tmax: usize, device: &Device) -> Result<Self> {
        let eye = Tensor::eye(k, DType::F64, device)?.unsqueeze(0)?;
        let stacked = eye.repeat((tmax + 1, 1, 1))?;
        Ok(Self { q: stacked.clone(), q_bar: stacked, tmax, k })
    }

    /// Wrap externally computed `(tmax + 1, K, K)` kernels.
    pub fn from_tensors(q: Tensor, q_bar: Tensor) -> Result<Self> {
        let (steps, k, k2) = q.dims3()?;
        if k != k2 || steps < 2 {
            return Err(ProtDiffError::shape("transition matrices", "(tmax + 1, K, K)", q.dims()));
        }
        ensure_dims(&q_bar, &[steps, k, k], "cumulative transition matrices")?;
        Ok(Self { q: q.to_dtype(DType::F64)?, q_bar: q_bar.to_dtype(DType::F64)?, tmax: steps - 1, k })
    }

    pub fn tmax(&self) -> usize {
        self.tmax
    }

    pub fn num_classes(&self) -> usize {
        self.k
    }

    pub fn q(&self) -> &Tensor {
        &self.q
    }

    pub fn q_bar(&self) -> &Tensor {
        &self.q_bar
    }

    /// `Q_t`, `(K, K)`.
    pub fn q_at(&self, t: usize) -> Result<Tensor> {
        self.check_step(t)?;
        Ok(self.q.i(t)?)
    }

    /// `Q_bar_t`, `(K, K)`.
    pub fn q_bar_at(&self, t: usize) -> Result<Tensor> {
        self.check_step(t)?;
        Ok(self.q_bar.i(t)?)
    }

    fn check_step(&self, t: usize) -> Result<()> {
        if t > self.tmax {
            return Err(ProtDiffError::InvalidTimestep {
                index: 0,
                timestep: t as u32,
                tmax: self.tmax,
            });
        }
        Ok(())
    }

    /// Verify every row of every kernel sums to one within `tol`.
    pub fn check_stochastic(&self, tol: f64) -> Result<()> {
        for (name, kernels) in [("q", &self.q), ("q_bar", &self.q_bar)] {
            let sums = kernels.sum(D::Minus1)?.flatten_all()?.to_vec1::<f64>()?;
            if let Some((i, s)) = sums.iter().enumerate().find(|&(_, s)| (s - 1.0).abs() > tol) {
                let (step, row) = (i / self.k, i % self.k);
                return Err(ProtDiffError::InvalidArgument(format!(
                    "{name}[{step}] row {row} sums to {s}"
                )));
            }
        }
        Ok(())
    }

    /// Forward marginal `q(x_t | x_0) = x_0 Q_bar_t`.
    ///
    /// `x0_onehot` is `(..., K)`; the output has the same shape in `F64`.
    pub fn forward_marginal(&self, x0_onehot: &Tensor, t: usize) -> Result<Tensor> {
        let q_bar_t = self.q_bar_at(t)?;
        self.check_classes(x0_onehot, "forward_marginal")?;
        Ok(x0_onehot.to_dtype(DType::F64)?.broadcast_matmul(&q_bar_t)?)
    }

    /// Closed-form posterior `q(x_{t-1} | x_t, x_0)`, for `t >= 1`.
    ///
    /// Proportional to `(x_t Q_t^T) * (x_0 Q_bar_{t-1})` and row normalised.
    pub fn posterior(&self, x0_onehot: &Tensor, xt_onehot: &Tensor, t: usize) -> Result<Tensor> {
        if t == 0 {
            return Err(ProtDiffError::InvalidTimestep { index: 0, timestep: 0, tmax: self.tmax });
        }
        self.check_classes(x0_onehot, "posterior x_0")?;
        ensure_dims(xt_onehot, x0_onehot.dims(), "posterior x_t")?;

        let q_t = self.q_at(t)?.t()?.contiguous()?;
        let q_bar_prev = self.q_bar_at(t - 1)?;
        let fact1 = xt_onehot.to_dtype(DType::F64)?.broadcast_matmul(&q_t)?;
        let fact2 = x0_onehot.to_dtype(DType::F64)?.broadcast_matmul(&q_bar_prev)?;
        let unnorm = (fact1 * fact2)?;
        Ok(unnorm.broadcast_div(&unnorm.sum_keepdim(D::Minus1)?)?)
    }

    fn check_classes(&self, onehot: &Tensor, op: &'static str) -> Result<()> {
        let dims = onehot.dims();
        match dims.split_last() {
            Some((&k, _)) if k == self.k => Ok(()),
            _ => Err(ProtDiffError::shape(op, format!("(..., {})", self.k), dims)),
        }
    }
}
