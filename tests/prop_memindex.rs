//! Property tests for the in-memory secondary index against a reference
//! `HashMap<String, HashSet<u64>>` model.

use bmdb::MemIndex;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

fn key(v: u8) -> String {
    format!("{v:03}")
}

proptest! {
    #[test]
    fn insert_remove_matches_reference_model(
        ops in proptest::collection::vec((any::<bool>(), 0u8..40, 0u64..200), 0..300)
    ) {
        let mut index = MemIndex::new();
        let mut reference: HashMap<String, HashSet<u64>> = HashMap::new();
        for (insert, value, doc_id) in ops {
            let k = key(value);
            if insert {
                index.insert(&k, doc_id);
                reference.entry(k).or_default().insert(doc_id);
            } else {
                index.remove(&k, doc_id);
                if let Some(set) = reference.get_mut(&k) {
                    set.remove(&doc_id);
                }
            }
        }

        for value in 0u8..40 {
            let k = key(value);
            let expected: Vec<u64> = reference.get(&k).map(|s| {
                let mut v: Vec<u64> = s.iter().copied().collect();
                v.sort_unstable();
                v
            }).unwrap_or_default();
            let got: Vec<u64> = {
                let mut v = index.get_exact(&k).map(|bm| bm.to_set()).unwrap_or_default();
                v.sort_unstable();
                v
            };
            prop_assert_eq!(got, expected, "mismatch for key {}", k);
        }
    }
}
