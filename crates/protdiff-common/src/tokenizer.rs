//! Protein sequence tokenizer.
//!
//! The amino-acid alphabet occupies indices `0..26`; special tokens follow.
//! Posterior math only ever sees the amino-acid block, so
//! [`ProteinTokenizer::all_aas_len`] is the `K` of every transition matrix.

use candle_core::{Device, Tensor};

use crate::{ProtDiffError, Result};

/// Canonical, ambiguous and rare amino acids.
pub const ALL_AAS: &str = "ACDEFGHIKLMNPQRSTVWYBZXJOU";
pub const GAP: char = '-';
pub const STOP: char = '*';
pub const MASK: char = '#';
pub const START: char = '@';
pub const PAD: char = '!';

/// Token-level interface consumed by collators and the evaluation driver.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;
    fn vocab_size(&self) -> usize;
    fn pad_token_id(&self) -> u32;
    fn mask_token_id(&self) -> u32;
}

/// Character-level tokenizer over [`ALL_AAS`] plus specials.
#[derive(Debug, Clone)]
pub struct ProteinTokenizer {
    alphabet: Vec<char>,
    all_aas: usize,
}

impl Default for ProteinTokenizer {
    fn default() -> Self {
        let mut alphabet: Vec<char> = ALL_AAS.chars().collect();
        let all_aas = alphabet.len();
        alphabet.extend([GAP, STOP, MASK, START, PAD]);
        Self { alphabet, all_aas }
    }
}

impl ProteinTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of amino-acid tokens (`K`).
    pub fn all_aas_len(&self) -> usize {
        self.all_aas
    }

    /// Full alphabet length, specials included.
    pub fn alphabet_len(&self) -> usize {
        self.alphabet.len()
    }

    pub fn token_id(&self, c: char) -> Option<u32> {
        self.alphabet.iter().position(|&a| a == c).map(|i| i as u32)
    }

    pub fn gap_token_id(&self) -> u32 {
        self.special(GAP)
    }

    pub fn stop_token_id(&self) -> u32 {
        self.special(STOP)
    }

    pub fn start_token_id(&self) -> u32 {
        self.special(START)
    }

    fn special(&self, c: char) -> u32 {
        // specials are appended in a fixed order after the amino acids
        let offset = [GAP, STOP, MASK, START, PAD].iter().position(|&s| s == c).unwrap_or(0);
        (self.all_aas + offset) as u32
    }

    /// One-hot encode amino-acid tokens over the `K` amino-acid classes.
    ///
    /// Output has the input shape plus a trailing `K` axis, `F32`.
    pub fn one_hot(&self, tokens: &Tensor) -> Result<Tensor> {
        let ids = crate::tensor::token_ids(tokens)?;
        if let Some(&bad) =
            ids.flatten_all()?.to_vec1::<u32>()?.iter().find(|&&t| t as usize >= self.all_aas)
        {
            return Err(ProtDiffError::InvalidToken { token: bad, vocab: self.all_aas });
        }
        Ok(candle_nn::encoding::one_hot(ids, self.all_aas, 1f32, 0f32)?)
    }

    /// Encode `text` straight into a `(1, L)` `U32` tensor.
    pub fn encode_tensor(&self, text: &str, device: &Device) -> Result<Tensor> {
        let ids = self.encode(text)?;
        let len = ids.len();
        Ok(Tensor::from_vec(ids, (1, len), device)?)
    }
}

impl Tokenizer for ProteinTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                self.token_id(c)
                    .ok_or_else(|| ProtDiffError::Tokenizer(format!("unknown residue {c:?}")))
            })
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| {
                self.alphabet
                    .get(t as usize)
                    .copied()
                    .ok_or(ProtDiffError::InvalidToken { token: t, vocab: self.alphabet.len() })
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.alphabet.len()
    }

    fn pad_token_id(&self) -> u32 {
        self.special(PAD)
    }

    fn mask_token_id(&self) -> u32 {
        self.special(MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_layout() {
        let tok = ProteinTokenizer::new();
        assert_eq!(tok.all_aas_len(), 26);
        assert_eq!(tok.alphabet_len(), 31);
        assert_eq!(tok.token_id('A'), Some(0));
        assert_eq!(tok.token_id('#'), Some(tok.mask_token_id()));
        assert_eq!(tok.pad_token_id(), 30);
    }

    #[test]
    fn encode_decode() {
        let tok = ProteinTokenizer::new();
        let ids = tok.encode("MKV#").unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[3], tok.mask_token_id());
        assert_eq!(tok.decode(&ids).unwrap(), "MKV#");
    }

    #[test]
    fn encode_rejects_unknown_residues() {
        let tok = ProteinTokenizer::new();
        assert!(matches!(tok.encode("AC1"), Err(ProtDiffError::Tokenizer(_))));
    }

    #[test]
    fn one_hot_covers_amino_acids_only() {
        let tok = ProteinTokenizer::new();
        let ids = tok.encode_tensor("ACY", &Device::Cpu).unwrap();
        let oh = tok.one_hot(&ids).unwrap();
        assert_eq!(oh.dims(), &[1, 3, 26]);
        let rows = oh.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[1][1], 1.0);
        assert_eq!(rows[2].iter().sum::<f32>(), 1.0);

        let masked = tok.encode_tensor("A#", &Device::Cpu).unwrap();
        assert!(matches!(tok.one_hot(&masked), Err(ProtDiffError::InvalidToken { .. })));
    }
}
