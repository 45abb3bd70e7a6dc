use candle_core::{DType, Device, Tensor};
use proptest::prelude::*;
use protdiff_common::tokenizer::ALL_AAS;
use protdiff_common::{ProteinTokenizer, Tokenizer};

fn residues() -> impl Strategy<Value = String> {
    let aas: Vec<char> = ALL_AAS.chars().collect();
    prop::collection::vec(prop::sample::select(aas), 1..64).prop_map(|c| c.into_iter().collect())
}

proptest! {
    #[test]
    fn encoded_residues_stay_in_the_amino_acid_block(seq in residues()) {
        let tok = ProteinTokenizer::new();
        let ids = tok.encode(&seq).unwrap();
        prop_assert_eq!(ids.len(), seq.chars().count());
        prop_assert!(ids.iter().all(|&id| (id as usize) < tok.all_aas_len()));
        prop_assert_eq!(tok.decode(&ids).unwrap(), seq);
    }

    #[test]
    fn one_hot_rows_are_indicators(seq in residues()) {
        let tok = ProteinTokenizer::new();
        let ids = tok.encode_tensor(&seq, &Device::Cpu).unwrap();
        let oh = tok.one_hot(&ids).unwrap();
        prop_assert_eq!(oh.dtype(), DType::F32);
        let sums = oh.sum(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        prop_assert!(sums.iter().all(|&s| s == 1.0));
        let argmax = oh.argmax(2).unwrap().flatten_all().unwrap().to_vec1::<u32>().unwrap();
        prop_assert_eq!(argmax, tok.encode(&seq).unwrap());
    }
}

#[test]
fn specials_sit_after_the_amino_acids() {
    let tok = ProteinTokenizer::new();
    let specials = [tok.gap_token_id(), tok.stop_token_id(), tok.mask_token_id(), tok.start_token_id()];
    assert!(specials.iter().all(|&id| id as usize >= tok.all_aas_len()));
    assert_eq!(tok.vocab_size(), tok.alphabet_len());
    let pad = Tensor::new(&[[tok.pad_token_id()]], &Device::Cpu).unwrap();
    assert!(tok.one_hot(&pad).is_err());
}
