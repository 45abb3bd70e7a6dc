//! Loss functions for order-agnostic autoregressive and discrete-diffusion
//! protein sequence models.
//!
//! - [`OaMaskedCrossEntropyLoss`]: masked cross-entropy with optional
//!   OA-ARDM `1/t` reweighting
//! - [`D3pmCeLoss`] / [`D3pmCeLossMsa`]: padding-aware reconstruction loss
//! - [`D3pmLvbLoss`] / [`D3pmLvbLossMsa`]: the D3PM variational lower bound,
//!   dispatched per sequence over reconstruction, prior-KL and posterior-KL
//!   regimes
//! - [`TransitionMatrices`]: `Q` / `Q_bar` schedules and the closed-form
//!   forward posterior
//!
//! All reductions are carried out in `f64`.

pub mod d3pm;
pub mod lvb;
pub mod masked_ce;
pub mod ops;
pub mod prior;
pub mod transitions;

pub use d3pm::{D3pmCeLoss, D3pmCeLossMsa};
pub use lvb::{
    D3pmLvbLoss, D3pmLvbLossMsa, LvbBatch, LvbOutput, MsaLvbBatch, Regime, predicted_marginal,
};
pub use masked_ce::OaMaskedCrossEntropyLoss;
pub use prior::{sample_prior, sample_prior_3d};
pub use transitions::TransitionMatrices;
