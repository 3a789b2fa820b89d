//! Property tests for chunking and reassembly.
//!
//! Any file, chunked and delivered in any order with duplicates, reassembles byte-identical.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shadow_core::protocol::FileChunk;
use shadow_core::transfer::{
    file_packets, total_chunks, ChunkOutcome, CompleteOutcome, OutgoingFile, Reassembler,
    FILE_CHUNK_SIZE,
};
use shadow_core::{NodeId, Packet};

fn chunks(file: &OutgoingFile, id: &str) -> Vec<FileChunk> {
    file_packets(file, id)
        .into_iter()
        .filter_map(|p| match p {
            Packet::FileChunk(c) => Some(c),
            _ => None,
        })
        .collect()
}

fn file_strategy() -> impl Strategy<Value = (usize, u64)> {
    (1usize..(4 * FILE_CHUNK_SIZE + 100), any::<u64>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_permutation_with_duplicates_reassembles((len, seed) in file_strategy()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let file = OutgoingFile::new("f.bin", "application/octet-stream", data.clone());

        let mut delivery = chunks(&file, "t");
        prop_assert_eq!(delivery.len() as u32, total_chunks(len));
        prop_assert_eq!(delivery.len(), len.div_ceil(FILE_CHUNK_SIZE));
        let dupes: Vec<FileChunk> = delivery
            .iter()
            .filter(|_| rng.gen_bool(0.5))
            .cloned()
            .collect();
        delivery.extend(dupes);
        delivery.shuffle(&mut rng);

        let from = NodeId::from("shadow-aaa");
        let mut r = Reassembler::new();
        let mut completed = Vec::new();
        for c in delivery {
            if let ChunkOutcome::Complete(f) = r.on_chunk(&from, c, 0) {
                completed.push(f);
            }
        }
        prop_assert!(matches!(r.on_complete("t", 0), CompleteOutcome::Ignored));
        prop_assert_eq!(completed.len(), 1);
        prop_assert_eq!(&completed[0].data, &data);
        prop_assert_eq!(completed[0].size, len as u64);
    }

    #[test]
    fn repeated_complete_finalizes_once(len in 1usize..(3 * FILE_CHUNK_SIZE), repeats in 1usize..5) {
        let file = OutgoingFile::new("f.bin", "application/octet-stream", vec![9u8; len]);
        let mut r = Reassembler::new();
        let from = NodeId::from("shadow-aaa");
        let all = chunks(&file, "t");
        let keep = all.len().saturating_sub(1).max(1);
        let mut finalized = 0;
        for c in all.into_iter().take(keep) {
            if let ChunkOutcome::Complete(_) = r.on_chunk(&from, c, 0) {
                finalized += 1;
            }
        }
        for _ in 0..repeats {
            if let CompleteOutcome::Finalized { .. } = r.on_complete("t", 0) {
                finalized += 1;
            }
        }
        prop_assert_eq!(finalized, 1);
    }
}
