//! D3PM variational lower bound.
//!
//! Each sequence of a batch contributes one of three terms depending on its
//! timestep:
//!
//! - `t = 1`: reconstruction cross-entropy ([`D3pmCeLoss`])
//! - `t = T_max`: `KL(q(x_T | x_0) || prior)`, which vanishes for a schedule
//!   that reaches the stationary distribution
//! - otherwise: `KL(q(x_{t-1} | x_t, x_0) || p_theta(x_{t-1} | x_t))`
//!
//! Sequences are grouped by regime and each group is evaluated with batched
//! tensor ops; the per-sequence terms are then scattered back into batch
//! order. The batch value is the sum of the terms divided by the batch size.

use candle_core::{D, DType, Device, Tensor};
use candle_nn::ops::softmax;
use protdiff_common::tensor::{ensure_dims, row_counts, token_ids};
use protdiff_common::{LossConfig, ProtDiffError, ProteinTokenizer, Result};
use tracing::debug;

use crate::d3pm::{D3pmCeLoss, D3pmCeLossMsa};
use crate::ops::{ensure_prediction, kl_div_pointwise, length_mask, slice_vocab};
use crate::prior::{sample_prior, sample_prior_3d};
use crate::transitions::TransitionMatrices;

/// Which term of the bound a sequence contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regime {
    Reconstruction,
    Prior,
    Posterior,
}

impl Regime {
    /// Classify sequence `index` by its timestep. Both boundaries are
    /// inclusive: `1` is reconstruction, `tmax` is the prior term.
    pub fn for_timestep(index: usize, timestep: u32, tmax: usize) -> Result<Self> {
        match timestep as usize {
            1 => Ok(Self::Reconstruction),
            t if t == tmax => Ok(Self::Prior),
            t if t > 1 && t < tmax => Ok(Self::Posterior),
            _ => Err(ProtDiffError::InvalidTimestep { index, timestep, tmax }),
        }
    }
}

/// Result of an LVB evaluation.
#[derive(Debug, Clone)]
pub struct LvbOutput {
    /// Batch objective, `F64` scalar.
    pub lvb: Tensor,
    /// Term contributed by each sequence, `(N,)` `F64`.
    pub per_sequence: Tensor,
    pub regimes: Vec<Regime>,
}

/// Inputs of [`D3pmLvbLoss::forward`].
#[derive(Debug, Clone, Copy)]
pub struct LvbBatch<'a> {
    /// Noised tokens `x_t`, `(N, L)`.
    pub src: &'a Tensor,
    /// Forward marginal `q(x_t | x_0)`, `(N, L, K)`.
    pub q: &'a Tensor,
    /// True posterior `q(x_{t-1} | x_t, x_0)`, `(N, L, K)`.
    pub q_minus1: &'a Tensor,
    /// Model logits, `(N, L, V)` with `V >= K`.
    pub predictions: &'a Tensor,
    /// Clean tokens `x_0`, `(N, L)`.
    pub tgt: &'a Tensor,
    /// Non-padding positions, `(N, L)`.
    pub input_mask: &'a Tensor,
    /// Per-sequence timestep, `(N,)`.
    pub timestep: &'a Tensor,
}

/// Inputs of [`D3pmLvbLossMsa::forward`]. Every tensor gains a depth axis
/// after the batch axis.
#[derive(Debug, Clone, Copy)]
pub struct MsaLvbBatch<'a> {
    /// `(N, M, L)`
    pub src: &'a Tensor,
    /// One-hot `x_t` over the amino acids, `(N, M, L, K)`.
    pub one_hot: &'a Tensor,
    pub q: &'a Tensor,
    pub q_minus1: &'a Tensor,
    pub predictions: &'a Tensor,
    pub tgt: &'a Tensor,
    pub input_mask: &'a Tensor,
    /// `(N,)`
    pub timestep: &'a Tensor,
}

/// Predicted reverse marginal `p_theta(x_{t-1} | x_t)`.
///
/// Marginalises the model's `x_0` distribution through the forward kernels:
/// `marg[p, j] ∝ (x_t Q_t^T)[p, j] * (pred Q_bar_{t-1}^T)[p, j]`, row
/// normalised. `x_t` and `pred` are `(..., P, K)`; `q_t` and `q_bar_prev`
/// are `(K, K)` or batched `(..., K, K)`.
///
/// Everything is computed in `F64`: in `F32` the products underflow for
/// near-zero probabilities and the normalisation divides by zero.
pub fn predicted_marginal(
    x_t: &Tensor,
    q_t: &Tensor,
    q_bar_prev: &Tensor,
    pred: &Tensor,
) -> Result<Tensor> {
    ensure_dims(pred, x_t.dims(), "predicted_marginal prediction")?;
    let k = x_t.dim(D::Minus1)?;
    for (m, name) in [(q_t, "predicted_marginal Q_t"), (q_bar_prev, "predicted_marginal Q_bar")] {
        if m.rank() < 2 || m.dim(D::Minus1)? != k || m.dim(D::Minus2)? != k {
            return Err(ProtDiffError::shape(name, format!("(..., {k}, {k})"), m.dims()));
        }
    }

    let q_t = q_t.to_dtype(DType::F64)?.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    let q_bar = q_bar_prev.to_dtype(DType::F64)?.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    let fact1 = x_t.to_dtype(DType::F64)?.broadcast_matmul(&q_t)?;
    let fact2 = pred.to_dtype(DType::F64)?.broadcast_matmul(&q_bar)?;
    let unnorm = (fact1 * fact2)?;
    Ok(unnorm.broadcast_div(&unnorm.sum_keepdim(D::Minus1)?)?)
}

/// Batch indices of each regime.
struct RegimeGroups {
    reconstruction: Vec<u32>,
    prior: Vec<u32>,
    posterior: Vec<u32>,
}

impl RegimeGroups {
    fn new(regimes: &[Regime]) -> Self {
        let mut groups = Self { reconstruction: vec![], prior: vec![], posterior: vec![] };
        for (i, r) in regimes.iter().enumerate() {
            match r {
                Regime::Reconstruction => groups.reconstruction.push(i as u32),
                Regime::Prior => groups.prior.push(i as u32),
                Regime::Posterior => groups.posterior.push(i as u32),
            }
        }
        debug!(
            reconstruction = groups.reconstruction.len(),
            prior = groups.prior.len(),
            posterior = groups.posterior.len(),
            "lvb regime split"
        );
        groups
    }
}

fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(indices, indices.len(), device)?)
}

fn pick(values: &[u32], indices: &[u32]) -> Vec<u32> {
    indices.iter().map(|&i| values[i as usize]).collect()
}

fn divide(sums: &Tensor, denominators: impl Iterator<Item = f64>) -> Result<Tensor> {
    let denominators: Vec<f64> = denominators.collect();
    let len = denominators.len();
    Ok((sums / Tensor::from_vec(denominators, len, sums.device())?)?)
}

fn timestep_values(timestep: &Tensor, n: usize, op: &'static str) -> Result<Vec<u32>> {
    ensure_dims(timestep, &[n], op)?;
    Ok(token_ids(timestep)?.to_vec1::<u32>()?)
}

fn check_transitions(transitions: &TransitionMatrices, k: usize, tmax: usize) -> Result<()> {
    if transitions.num_classes() != k {
        return Err(ProtDiffError::shape(
            "lvb transition matrices",
            format!("({k}, {k}) kernels"),
            transitions.q().dims(),
        ));
    }
    if transitions.tmax() < tmax {
        return Err(ProtDiffError::InvalidArgument(format!(
            "transition schedule covers {} steps, loss expects {tmax}",
            transitions.tmax()
        )));
    }
    Ok(())
}

fn validate_tmax(tmax: usize) -> Result<()> {
    if tmax < 2 {
        return Err(ProtDiffError::InvalidArgument(format!("tmax must be >= 2, got {tmax}")));
    }
    Ok(())
}

fn finish(per_sequence: Tensor, regimes: Vec<Regime>) -> Result<LvbOutput> {
    let n = regimes.len();
    let lvb = per_sequence.sum_all()?.affine(1.0 / n as f64, 0.0)?;
    Ok(LvbOutput { lvb, per_sequence, regimes })
}

/// Variational lower bound for single sequences.
#[derive(Debug, Clone)]
pub struct D3pmLvbLoss {
    tmax: usize,
    tokenizer: ProteinTokenizer,
    reconstruction: D3pmCeLoss,
}

impl D3pmLvbLoss {
    pub fn new(tmax: usize) -> Result<Self> {
        Self::with_tokenizer(tmax, ProteinTokenizer::default())
    }

    pub fn from_config(config: &LossConfig) -> Result<Self> {
        Self::new(config.tmax)
    }

    pub fn with_tokenizer(tmax: usize, tokenizer: ProteinTokenizer) -> Result<Self> {
        validate_tmax(tmax)?;
        let reconstruction = D3pmCeLoss::new(tokenizer.clone());
        Ok(Self { tmax, tokenizer, reconstruction })
    }

    pub fn tmax(&self) -> usize {
        self.tmax
    }

    pub fn forward(&self, batch: &LvbBatch<'_>, transitions: &TransitionMatrices) -> Result<LvbOutput> {
        let (n, l) = batch.tgt.dims2()?;
        if n == 0 {
            return Err(ProtDiffError::InvalidArgument("lvb batch is empty".into()));
        }
        let k = self.tokenizer.all_aas_len();
        ensure_dims(batch.src, &[n, l], "lvb src")?;
        ensure_dims(batch.input_mask, &[n, l], "lvb input mask")?;
        ensure_dims(batch.q, &[n, l, k], "lvb q")?;
        ensure_dims(batch.q_minus1, &[n, l, k], "lvb q_minus1")?;
        ensure_prediction(batch.predictions, batch.tgt, "lvb predictions")?;
        check_transitions(transitions, k, self.tmax)?;

        let timesteps = timestep_values(batch.timestep, n, "lvb timestep")?;
        let regimes = timesteps
            .iter()
            .enumerate()
            .map(|(i, &t)| Regime::for_timestep(i, t, self.tmax))
            .collect::<Result<Vec<_>>>()?;
        let lengths = row_counts(batch.input_mask)?;
        let groups = RegimeGroups::new(&regimes);
        let device = batch.tgt.device();
        let mut per_sequence = Tensor::zeros(n, DType::F64, device)?;

        if !groups.reconstruction.is_empty() {
            let idx = index_tensor(&groups.reconstruction, device)?;
            let loss = self.reconstruction.per_sequence(
                &batch.predictions.index_select(&idx, 0)?,
                &batch.tgt.index_select(&idx, 0)?,
                &batch.input_mask.index_select(&idx, 0)?,
            )?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        if !groups.prior.is_empty() {
            let idx = index_tensor(&groups.prior, device)?;
            let lens = pick(&lengths, &groups.prior);
            let q_true = batch.q.index_select(&idx, 0)?.to_dtype(DType::F64)?;
            let shape = q_true.dims();
            let valid = length_mask(&lens, l, device)?.unsqueeze(2)?.broadcast_as(shape)?.contiguous()?;
            let prior = sample_prior(l, k, k, device)?.log()?.broadcast_as(shape)?.contiguous()?;
            let kl = kl_div_pointwise(&prior, &q_true, &valid)?.sum((1, 2))?;
            let loss = divide(&kl, lens.iter().map(|&d| d as f64))?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        if !groups.posterior.is_empty() {
            let idx = index_tensor(&groups.posterior, device)?;
            let lens = pick(&lengths, &groups.posterior);
            let steps = pick(&timesteps, &groups.posterior);
            let prev: Vec<u32> = steps.iter().map(|t| t - 1).collect();
            let q_t = transitions.q().index_select(&index_tensor(&steps, device)?, 0)?;
            let q_bar_prev = transitions.q_bar().index_select(&index_tensor(&prev, device)?, 0)?;

            // padding ids are not amino acids; they are masked out of the KL
            let keep = length_mask(&lens, l, device)?;
            let src = token_ids(batch.src)?.index_select(&idx, 0)?;
            let src = keep.where_cond(&src, &src.zeros_like()?)?;
            let x_t = self.tokenizer.one_hot(&src)?;

            let logits = slice_vocab(&batch.predictions.index_select(&idx, 0)?, k)?;
            let pred = softmax(&logits.to_dtype(DType::F64)?, D::Minus1)?;
            let marg = predicted_marginal(&x_t, &q_t, &q_bar_prev, &pred)?;

            let q_true = batch.q_minus1.index_select(&idx, 0)?;
            let valid = keep.unsqueeze(2)?.broadcast_as(marg.dims())?.contiguous()?;
            let kl = kl_div_pointwise(&marg.log()?, &q_true, &valid)?.sum((1, 2))?;
            let loss = divide(&kl, lens.iter().map(|&d| d as f64))?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        finish(per_sequence, regimes)
    }
}

/// Variational lower bound for multiple sequence alignments.
///
/// Rows of one alignment share a padding length, read from the first row.
/// The prior term is normalised by the alignment depth and uses the full
/// alphabet (specials included) as its support size; the posterior term is
/// normalised by `depth * length`.
#[derive(Debug, Clone)]
pub struct D3pmLvbLossMsa {
    tmax: usize,
    tokenizer: ProteinTokenizer,
    reconstruction: D3pmCeLossMsa,
}

impl D3pmLvbLossMsa {
    pub fn new(tmax: usize) -> Result<Self> {
        Self::with_tokenizer(tmax, ProteinTokenizer::default())
    }

    pub fn from_config(config: &LossConfig) -> Result<Self> {
        Self::new(config.tmax)
    }

    pub fn with_tokenizer(tmax: usize, tokenizer: ProteinTokenizer) -> Result<Self> {
        validate_tmax(tmax)?;
        let reconstruction = D3pmCeLossMsa::new(tokenizer.clone());
        Ok(Self { tmax, tokenizer, reconstruction })
    }

    pub fn tmax(&self) -> usize {
        self.tmax
    }

    pub fn forward(&self, batch: &MsaLvbBatch<'_>, transitions: &TransitionMatrices) -> Result<LvbOutput> {
        let (n, depth, l) = batch.tgt.dims3()?;
        if n == 0 {
            return Err(ProtDiffError::InvalidArgument("lvb batch is empty".into()));
        }
        let k = self.tokenizer.all_aas_len();
        ensure_dims(batch.src, &[n, depth, l], "msa lvb src")?;
        ensure_dims(batch.input_mask, &[n, depth, l], "msa lvb input mask")?;
        ensure_dims(batch.one_hot, &[n, depth, l, k], "msa lvb one_hot")?;
        ensure_dims(batch.q, &[n, depth, l, k], "msa lvb q")?;
        ensure_dims(batch.q_minus1, &[n, depth, l, k], "msa lvb q_minus1")?;
        ensure_prediction(batch.predictions, batch.tgt, "msa lvb predictions")?;
        check_transitions(transitions, k, self.tmax)?;

        let timesteps = timestep_values(batch.timestep, n, "msa lvb timestep")?;
        let regimes = timesteps
            .iter()
            .enumerate()
            .map(|(i, &t)| Regime::for_timestep(i, t, self.tmax))
            .collect::<Result<Vec<_>>>()?;
        let lengths = row_counts(&batch.input_mask.narrow(1, 0, 1)?.squeeze(1)?)?;
        let groups = RegimeGroups::new(&regimes);
        let device = batch.tgt.device();
        let mut per_sequence = Tensor::zeros(n, DType::F64, device)?;

        // (G, M, L) mask of the positions inside each alignment's length
        let depth_mask = |lens: &[u32]| -> Result<Tensor> {
            let g = lens.len();
            Ok(length_mask(lens, l, device)?.unsqueeze(1)?.broadcast_as((g, depth, l))?.contiguous()?)
        };

        if !groups.reconstruction.is_empty() {
            let idx = index_tensor(&groups.reconstruction, device)?;
            let loss = self.reconstruction.per_alignment(
                &batch.predictions.index_select(&idx, 0)?,
                &batch.tgt.index_select(&idx, 0)?,
                &batch.input_mask.index_select(&idx, 0)?,
            )?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        if !groups.prior.is_empty() {
            let idx = index_tensor(&groups.prior, device)?;
            let lens = pick(&lengths, &groups.prior);
            let q_true = batch.q.index_select(&idx, 0)?.to_dtype(DType::F64)?;
            let shape = q_true.dims();
            let valid = depth_mask(&lens)?.unsqueeze(3)?.broadcast_as(shape)?.contiguous()?;
            let prior = sample_prior_3d(depth, l, k, self.tokenizer.alphabet_len(), device)?
                .log()?
                .broadcast_as(shape)?
                .contiguous()?;
            let kl = kl_div_pointwise(&prior, &q_true, &valid)?.sum((1, 2, 3))?;
            let loss = kl.affine(1.0 / depth as f64, 0.0)?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        if !groups.posterior.is_empty() {
            let idx = index_tensor(&groups.posterior, device)?;
            let g = groups.posterior.len();
            let lens = pick(&lengths, &groups.posterior);
            let steps = pick(&timesteps, &groups.posterior);
            let prev: Vec<u32> = steps.iter().map(|t| t - 1).collect();
            let q_t = transitions.q().index_select(&index_tensor(&steps, device)?, 0)?;
            let q_bar_prev = transitions.q_bar().index_select(&index_tensor(&prev, device)?, 0)?;

            let flat = (g, depth * l, k);
            let x_t = batch.one_hot.index_select(&idx, 0)?.reshape(flat)?;
            let logits = slice_vocab(&batch.predictions.index_select(&idx, 0)?, k)?;
            let pred = softmax(&logits.to_dtype(DType::F64)?, D::Minus1)?.reshape(flat)?;
            let marg = predicted_marginal(&x_t, &q_t, &q_bar_prev, &pred)?;

            let q_true = batch.q_minus1.index_select(&idx, 0)?.reshape(flat)?;
            let valid = depth_mask(&lens)?.reshape((g, depth * l, 1))?.broadcast_as(flat)?.contiguous()?;
            let kl = kl_div_pointwise(&marg.log()?, &q_true, &valid)?.sum((1, 2))?;
            let loss = divide(&kl, lens.iter().map(|&d| (depth * d as usize) as f64))?;
            per_sequence = per_sequence.index_add(&idx, &loss, 0)?;
        }

        finish(per_sequence, regimes)
    }
}
