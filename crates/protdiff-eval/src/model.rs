//! The model seam of the evaluation driver.

use std::collections::HashMap;

use candle_core::Tensor;
use protdiff_common::{ProtDiffError, Result};

/// What a forward pass returns.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// `(N, L, V)` logits.
    Logits(Tensor),
    /// Named outputs; the logits live under `"logits"`.
    Named(HashMap<String, Tensor>),
}

impl ModelOutput {
    /// Extract the logits, detached from any autograd graph.
    pub fn into_logits(self) -> Result<Tensor> {
        let logits = match self {
            Self::Logits(t) => t,
            Self::Named(mut outputs) => outputs.remove("logits").ok_or_else(|| {
                ProtDiffError::InvalidArgument("model output has no \"logits\" entry".into())
            })?,
        };
        Ok(logits.detach())
    }
}

/// A trained sequence model, called as `model(src, timestep)`.
///
/// Evaluation never back-propagates; implementations are free to skip
/// gradient bookkeeping.
pub trait SequenceModel {
    fn forward(&self, src: &Tensor, timestep: &Tensor) -> Result<ModelOutput>;
}

impl<M: SequenceModel + ?Sized> SequenceModel for &M {
    fn forward(&self, src: &Tensor, timestep: &Tensor) -> Result<ModelOutput> {
        (**self).forward(src, timestep)
    }
}

impl<M: SequenceModel + ?Sized> SequenceModel for Box<M> {
    fn forward(&self, src: &Tensor, timestep: &Tensor) -> Result<ModelOutput> {
        (**self).forward(src, timestep)
    }
}
