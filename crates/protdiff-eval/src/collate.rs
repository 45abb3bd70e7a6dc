//! Reference collators.
//!
//! Each collator turns raw sequences into the [`CollatedBatch`] variant of
//! its noising scheme. All randomness comes from the generator passed in,
//! so a seeded run is reproducible.

use candle_core::{Device, Tensor};
use protdiff_common::{ProtDiffError, ProteinTokenizer, Result, Tokenizer};
use protdiff_losses::TransitionMatrices;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, RngCore};

use crate::scheme::{CollatedBatch, NoisingScheme};

/// Builds scheme-specific model inputs from raw sequences.
pub trait Collater {
    fn scheme(&self) -> NoisingScheme;

    fn tokenizer(&self) -> &dyn Tokenizer;

    fn collate(&self, sequences: &[String], rng: &mut dyn RngCore) -> Result<CollatedBatch>;
}

fn encode_all(tokenizer: &ProteinTokenizer, sequences: &[String]) -> Result<Vec<Vec<u32>>> {
    if sequences.is_empty() {
        return Err(ProtDiffError::InvalidArgument("cannot collate an empty batch".into()));
    }
    sequences
        .iter()
        .map(|s| {
            let ids = tokenizer.encode(s)?;
            if ids.is_empty() {
                return Err(ProtDiffError::InvalidArgument("cannot collate an empty sequence".into()));
            }
            Ok(ids)
        })
        .collect()
}

/// Right-pad rows to a common length and stack them into `(N, L)`.
fn pad_rows<T: candle_core::WithDType>(rows: &[Vec<T>], fill: T, device: &Device) -> Result<Tensor> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat_n(fill, width - row.len()));
    }
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Zero-pad `(1, l, K)` tensors along the length axis and stack them.
fn pad_dense(parts: &[Tensor]) -> Result<Tensor> {
    let mut width = 0;
    for p in parts {
        width = width.max(p.dim(1)?);
    }
    let padded = parts
        .iter()
        .map(|p| Ok(p.pad_with_zeros(1, 0, width - p.dim(1)?)?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&padded, 0)?)
}

/// Order-agnostic masking: draw `t ~ U{1..=L}` and mask `t` distinct
/// positions.
#[derive(Debug, Clone)]
pub struct OaMaskCollater {
    tokenizer: ProteinTokenizer,
    device: Device,
    external: bool,
}

impl OaMaskCollater {
    pub fn new(tokenizer: ProteinTokenizer, device: Device) -> Self {
        Self { tokenizer, device, external: false }
    }

    /// Same masking, emitted as [`CollatedBatch::ExternalMask`] for models
    /// with named outputs.
    pub fn external(tokenizer: ProteinTokenizer, device: Device) -> Self {
        Self { tokenizer, device, external: true }
    }
}

impl Collater for OaMaskCollater {
    fn scheme(&self) -> NoisingScheme {
        if self.external { NoisingScheme::ExternalMask } else { NoisingScheme::OrderAgnosticMask }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn collate(&self, sequences: &[String], rng: &mut dyn RngCore) -> Result<CollatedBatch> {
        let tgt_rows = encode_all(&self.tokenizer, sequences)?;
        let mask_id = self.tokenizer.mask_token_id();

        let mut src_rows = Vec::with_capacity(tgt_rows.len());
        let mut mask_rows = Vec::with_capacity(tgt_rows.len());
        let mut timesteps = Vec::with_capacity(tgt_rows.len());
        for ids in &tgt_rows {
            let len = ids.len();
            let t = rng.gen_range(1..=len);
            let mut src = ids.clone();
            let mut mask = vec![0u8; len];
            for pos in rand::seq::index::sample(rng, len, t).iter() {
                src[pos] = mask_id;
                mask[pos] = 1;
            }
            src_rows.push(src);
            mask_rows.push(mask);
            timesteps.push(t as u32);
        }

        let pad = self.tokenizer.pad_token_id();
        let src = pad_rows(&src_rows, pad, &self.device)?;
        let tgt = pad_rows(&tgt_rows, pad, &self.device)?;
        let mask = pad_rows(&mask_rows, 0u8, &self.device)?;
        let n = timesteps.len();
        let timestep = Tensor::from_vec(timesteps, n, &self.device)?;
        Ok(if self.external {
            CollatedBatch::ExternalMask { src, timestep, tgt, mask }
        } else {
            CollatedBatch::OrderAgnosticMask { src, timestep, tgt, mask }
        })
    }
}

/// Left-to-right next-token batches: `src` is the start token followed by
/// the sequence, `tgt` the sequence followed by the stop token, every
/// target position scored.
#[derive(Debug, Clone)]
pub struct CausalMaskCollater {
    tokenizer: ProteinTokenizer,
    device: Device,
}

impl CausalMaskCollater {
    pub fn new(tokenizer: ProteinTokenizer, device: Device) -> Self {
        Self { tokenizer, device }
    }
}

impl Collater for CausalMaskCollater {
    fn scheme(&self) -> NoisingScheme {
        NoisingScheme::CausalMask
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn collate(&self, sequences: &[String], _rng: &mut dyn RngCore) -> Result<CollatedBatch> {
        let rows = encode_all(&self.tokenizer, sequences)?;
        let (start, stop) = (self.tokenizer.start_token_id(), self.tokenizer.stop_token_id());
        let src_rows: Vec<Vec<u32>> =
            rows.iter().map(|r| std::iter::once(start).chain(r.iter().copied()).collect()).collect();
        let tgt_rows: Vec<Vec<u32>> =
            rows.iter().map(|r| r.iter().copied().chain(std::iter::once(stop)).collect()).collect();
        let mask_rows: Vec<Vec<u8>> = tgt_rows.iter().map(|r| vec![1u8; r.len()]).collect();

        let pad = self.tokenizer.pad_token_id();
        Ok(CollatedBatch::CausalMask {
            src: pad_rows(&src_rows, pad, &self.device)?,
            tgt: pad_rows(&tgt_rows, pad, &self.device)?,
            mask: pad_rows(&mask_rows, 0u8, &self.device)?,
        })
    }
}

/// D3PM forward noising: draw `t ~ U{1..=tmax}`, sample `x_t` from
/// `x_0 Q_bar_t` and attach the forward marginal and the true posterior.
#[derive(Debug, Clone)]
pub struct D3pmCollater {
    tokenizer: ProteinTokenizer,
    transitions: TransitionMatrices,
    device: Device,
}

impl D3pmCollater {
    pub fn new(tokenizer: ProteinTokenizer, transitions: TransitionMatrices, device: Device) -> Result<Self> {
        if transitions.num_classes() != tokenizer.all_aas_len() {
            return Err(ProtDiffError::InvalidArgument(format!(
                "transition kernels cover {} classes, tokenizer has {} amino acids",
                transitions.num_classes(),
                tokenizer.all_aas_len()
            )));
        }
        Ok(Self { tokenizer, transitions, device })
    }

    pub fn transitions(&self) -> &TransitionMatrices {
        &self.transitions
    }

    fn sample_tokens(probs: &[Vec<f64>], rng: &mut dyn RngCore) -> Result<Vec<u32>> {
        probs
            .iter()
            .map(|row| {
                let dist = WeightedIndex::new(row)
                    .map_err(|e| ProtDiffError::InvalidArgument(format!("bad forward marginal: {e}")))?;
                Ok(dist.sample(rng) as u32)
            })
            .collect()
    }
}

impl Collater for D3pmCollater {
    fn scheme(&self) -> NoisingScheme {
        NoisingScheme::Diffusion
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn collate(&self, sequences: &[String], rng: &mut dyn RngCore) -> Result<CollatedBatch> {
        let rows = encode_all(&self.tokenizer, sequences)?;
        let tmax = self.transitions.tmax();

        let mut src_rows = Vec::with_capacity(rows.len());
        let mut timesteps = Vec::with_capacity(rows.len());
        let (mut src_oh, mut tgt_oh, mut q_x, mut q_minus1) = (vec![], vec![], vec![], vec![]);
        for ids in &rows {
            let t = rng.gen_range(1..=tmax);
            let x0 = Tensor::from_slice(ids, (1, ids.len()), &self.device)?;
            let x0_oh = self.tokenizer.one_hot(&x0)?;
            let marginal = self.transitions.forward_marginal(&x0_oh, t)?;

            let xt_ids = Self::sample_tokens(&marginal.squeeze(0)?.to_vec2::<f64>()?, rng)?;
            let xt = Tensor::from_slice(&xt_ids, (1, xt_ids.len()), &self.device)?;
            let xt_oh = self.tokenizer.one_hot(&xt)?;

            q_minus1.push(self.transitions.posterior(&x0_oh, &xt_oh, t)?);
            q_x.push(marginal);
            src_oh.push(xt_oh);
            tgt_oh.push(x0_oh);
            src_rows.push(xt_ids);
            timesteps.push(t as u32);
        }

        let pad = self.tokenizer.pad_token_id();
        let n = timesteps.len();
        Ok(CollatedBatch::Diffusion {
            src: pad_rows(&src_rows, pad, &self.device)?,
            src_onehot: pad_dense(&src_oh)?,
            timestep: Tensor::from_vec(timesteps, n, &self.device)?,
            tgt: pad_rows(&rows, pad, &self.device)?,
            tgt_onehot: pad_dense(&tgt_oh)?,
            q_x: pad_dense(&q_x)?,
            q_minus1: pad_dense(&q_minus1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn seqs(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn oa_mask_count_matches_timestep() {
        let tok = ProteinTokenizer::new();
        let collater = OaMaskCollater::new(tok.clone(), Device::Cpu);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            let batch = collater.collate(&seqs(&["MKVLAAGW"]), &mut rng).unwrap();
            let CollatedBatch::OrderAgnosticMask { src, timestep, tgt, mask } = batch else {
                panic!("wrong variant");
            };
            let t = timestep.to_vec1::<u32>().unwrap()[0];
            let mask = mask.squeeze(0).unwrap().to_vec1::<u8>().unwrap();
            let src = src.squeeze(0).unwrap().to_vec1::<u32>().unwrap();
            let tgt = tgt.squeeze(0).unwrap().to_vec1::<u32>().unwrap();
            assert!((1..=8).contains(&t));
            assert_eq!(mask.iter().map(|&m| m as u32).sum::<u32>(), t);
            for i in 0..8 {
                if mask[i] == 1 {
                    assert_eq!(src[i], tok.mask_token_id());
                } else {
                    assert_eq!(src[i], tgt[i]);
                }
            }
        }
    }

    #[test]
    fn oa_batches_are_padded() {
        let tok = ProteinTokenizer::new();
        let collater = OaMaskCollater::external(tok.clone(), Device::Cpu);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batch = collater.collate(&seqs(&["MK", "MKVL"]), &mut rng).unwrap();
        assert_eq!(batch.scheme(), NoisingScheme::ExternalMask);
        let tgt = batch.tgt().to_vec2::<u32>().unwrap();
        assert_eq!(tgt[0][2..], [tok.pad_token_id(), tok.pad_token_id()]);
    }

    #[test]
    fn causal_batch_shifts_by_one() {
        let tok = ProteinTokenizer::new();
        let collater = CausalMaskCollater::new(tok.clone(), Device::Cpu);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batch = collater.collate(&seqs(&["MKV"]), &mut rng).unwrap();
        let src = batch.src().to_vec2::<u32>().unwrap();
        let tgt = batch.tgt().to_vec2::<u32>().unwrap();
        assert_eq!(src[0][0], tok.start_token_id());
        assert_eq!(src[0][1..], tgt[0][..3]);
        assert_eq!(tgt[0][3], tok.stop_token_id());
    }

    #[test]
    fn d3pm_batch_is_consistent() {
        let tok = ProteinTokenizer::new();
        let tm = TransitionMatrices::uniform(tok.all_aas_len(), 20, &Device::Cpu).unwrap();
        let collater = D3pmCollater::new(tok, tm, Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..10 {
            let batch = collater.collate(&seqs(&["MKVLAGW"]), &mut rng).unwrap();
            let CollatedBatch::Diffusion { src, timestep, q_x, q_minus1, src_onehot, .. } = batch else {
                panic!("wrong variant");
            };
            let t = timestep.to_vec1::<u32>().unwrap()[0];
            assert!((1..=20).contains(&t));
            assert!(src.flatten_all().unwrap().to_vec1::<u32>().unwrap().iter().all(|&x| x < 26));
            assert_eq!(src_onehot.dims(), &[1, 7, 26]);
            for dist in [q_x, q_minus1] {
                for s in dist.sum(2).unwrap().flatten_all().unwrap().to_vec1::<f64>().unwrap() {
                    assert!((s - 1.0).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let collater = OaMaskCollater::new(ProteinTokenizer::new(), Device::Cpu);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(collater.collate(&[], &mut rng).is_err());
        assert!(collater.collate(&seqs(&[""]), &mut rng).is_err());
    }
}
