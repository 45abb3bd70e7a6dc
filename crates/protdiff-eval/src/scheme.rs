//! Noising schemes and the batches their collators produce.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use protdiff_common::ProtDiffError;
use serde::{Deserialize, Serialize};

/// How a model was trained to corrupt its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoisingScheme {
    /// D3PM discrete diffusion.
    Diffusion,
    /// OA-ARDM random-order masking.
    OrderAgnosticMask,
    /// Strictly left-to-right next-token prediction.
    CausalMask,
    /// Masked model whose forward pass returns named outputs.
    ExternalMask,
}

impl NoisingScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diffusion => "diffusion",
            Self::OrderAgnosticMask => "order-agnostic-mask",
            Self::CausalMask => "causal-mask",
            Self::ExternalMask => "external-mask",
        }
    }
}

impl fmt::Display for NoisingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoisingScheme {
    type Err = ProtDiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diffusion" | "d3pm" => Ok(Self::Diffusion),
            "order-agnostic-mask" | "mask" | "oa-mask" => Ok(Self::OrderAgnosticMask),
            "causal-mask" | "causal" => Ok(Self::CausalMask),
            "external-mask" | "esm-mask" => Ok(Self::ExternalMask),
            other => Err(ProtDiffError::InvalidArgument(format!("unknown noising scheme {other:?}"))),
        }
    }
}

/// Model inputs and targets for one evaluation step, shaped by scheme.
///
/// Token tensors are `(N, L)` `U32`, masks `(N, L)` `U8`, timesteps `(N,)`.
#[derive(Debug, Clone)]
pub enum CollatedBatch {
    Diffusion {
        /// Noised tokens `x_t`.
        src: Tensor,
        src_onehot: Tensor,
        timestep: Tensor,
        tgt: Tensor,
        tgt_onehot: Tensor,
        /// `q(x_t | x_0)`, `(N, L, K)`.
        q_x: Tensor,
        /// `q(x_{t-1} | x_t, x_0)`, `(N, L, K)`.
        q_minus1: Tensor,
    },
    OrderAgnosticMask {
        src: Tensor,
        /// Number of masked positions per sequence.
        timestep: Tensor,
        tgt: Tensor,
        mask: Tensor,
    },
    CausalMask {
        src: Tensor,
        tgt: Tensor,
        mask: Tensor,
    },
    ExternalMask {
        src: Tensor,
        timestep: Tensor,
        tgt: Tensor,
        mask: Tensor,
    },
}

impl CollatedBatch {
    pub fn scheme(&self) -> NoisingScheme {
        match self {
            Self::Diffusion { .. } => NoisingScheme::Diffusion,
            Self::OrderAgnosticMask { .. } => NoisingScheme::OrderAgnosticMask,
            Self::CausalMask { .. } => NoisingScheme::CausalMask,
            Self::ExternalMask { .. } => NoisingScheme::ExternalMask,
        }
    }

    pub fn src(&self) -> &Tensor {
        match self {
            Self::Diffusion { src, .. }
            | Self::OrderAgnosticMask { src, .. }
            | Self::CausalMask { src, .. }
            | Self::ExternalMask { src, .. } => src,
        }
    }

    pub fn tgt(&self) -> &Tensor {
        match self {
            Self::Diffusion { tgt, .. }
            | Self::OrderAgnosticMask { tgt, .. }
            | Self::CausalMask { tgt, .. }
            | Self::ExternalMask { tgt, .. } => tgt,
        }
    }
}
