//! Property tests for bitmap set algebra against a reference `HashSet`.

use bmdb::Bitmap;
use proptest::prelude::*;
use std::collections::HashSet;

fn reference(ids: &[u16]) -> HashSet<u64> {
    ids.iter().map(|&i| u64::from(i)).collect()
}

proptest! {
    #[test]
    fn insert_remove_matches_reference_set(ops in proptest::collection::vec((any::<bool>(), 0u16..500), 0..200)) {
        let mut bm = Bitmap::new();
        let mut reference = HashSet::new();
        for (insert, id) in ops {
            let id = u64::from(id);
            if insert {
                bm.insert(id);
                reference.insert(id);
            } else {
                bm.remove(id);
                reference.remove(&id);
            }
        }
        let mut got: Vec<u64> = bm.to_set();
        got.sort_unstable();
        let mut expected: Vec<u64> = reference.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(got, expected);
        prop_assert_eq!(bm.is_empty(), expected.is_empty());
    }

    #[test]
    fn union_and_intersect_match_reference_sets(a_ids in proptest::collection::vec(0u16..300, 0..100), b_ids in proptest::collection::vec(0u16..300, 0..100)) {
        let a = Bitmap::from_set(a_ids.iter().map(|&i| u64::from(i)));
        let b = Bitmap::from_set(b_ids.iter().map(|&i| u64::from(i)));
        let ref_a = reference(&a_ids);
        let ref_b = reference(&b_ids);

        let mut union_got: Vec<u64> = Bitmap::union(&a, &b).to_set();
        union_got.sort_unstable();
        let mut union_expected: Vec<u64> = ref_a.union(&ref_b).copied().collect();
        union_expected.sort_unstable();
        prop_assert_eq!(union_got, union_expected);

        let mut inter_got: Vec<u64> = Bitmap::intersect(&a, &b).to_set();
        inter_got.sort_unstable();
        let mut inter_expected: Vec<u64> = ref_a.intersection(&ref_b).copied().collect();
        inter_expected.sort_unstable();
        prop_assert_eq!(inter_got, inter_expected);
    }
}
