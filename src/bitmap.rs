//! Bitmap postings: a packed bit vector over the dense docId space.
//!
//! All operations are total — there is no error taxonomy here, every
//! operation always succeeds. Words absent from a shorter operand are
//! treated as zero during `intersect`/`union`.

use serde::{Deserialize, Serialize};

const WORD_BITS: u32 = 32;

/// A compressed set of non-negative document IDs, stored as 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Bitmap {
    words: Vec<u32>,
    size: usize,
    max_doc_id: Option<u64>,
}

impl Bitmap {
    /// An empty bitmap.
    #[must_use]
    pub fn new() -> Self {
        Self { words: Vec::new(), size: 0, max_doc_id: None }
    }

    /// Build a bitmap from a set of doc ids, allocating `ceil((maxId+1)/32)` words.
    #[must_use]
    pub fn from_set(ids: impl IntoIterator<Item = u64>) -> Self {
        let mut bm = Self::new();
        for id in ids {
            bm.insert(id);
        }
        bm
    }

    /// Set membership: insert `id`, growing the word vector if needed.
    pub fn insert(&mut self, id: u64) {
        let (word_idx, bit) = Self::locate(id);
        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }
        let mask = 1u32 << bit;
        if self.words[word_idx] & mask == 0 {
            self.words[word_idx] |= mask;
            self.size += 1;
        }
        self.max_doc_id = Some(self.max_doc_id.map_or(id, |m| m.max(id)));
    }

    /// Remove `id` from the set, if present.
    pub fn remove(&mut self, id: u64) {
        let (word_idx, bit) = Self::locate(id);
        if word_idx >= self.words.len() {
            return;
        }
        let mask = 1u32 << bit;
        if self.words[word_idx] & mask != 0 {
            self.words[word_idx] &= !mask;
            self.size -= 1;
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        let (word_idx, bit) = Self::locate(id);
        self.words.get(word_idx).is_some_and(|w| w & (1u32 << bit) != 0)
    }

    /// Iterate all set bits in ascending order.
    #[must_use]
    pub fn to_set(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.size);
        for (word_idx, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros();
                out.push((word_idx as u64) * u64::from(WORD_BITS) + u64::from(bit));
                w &= w - 1;
            }
        }
        out
    }

    /// Number of set bits (popcount), tracked incrementally.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Lowest set bit, if any.
    #[must_use]
    pub fn first(&self) -> Option<u64> {
        for (word_idx, &word) in self.words.iter().enumerate() {
            if word != 0 {
                return Some((word_idx as u64) * u64::from(WORD_BITS) + u64::from(word.trailing_zeros()));
            }
        }
        None
    }

    #[must_use]
    pub fn max_doc_id(&self) -> Option<u64> {
        self.max_doc_id
    }

    /// Word-wise AND over `max(len(a), len(b))` words; missing words are zero.
    #[must_use]
    pub fn intersect(a: &Self, b: &Self) -> Self {
        let len = a.words.len().max(b.words.len());
        let mut words = Vec::with_capacity(len);
        let mut size = 0usize;
        for i in 0..len {
            let wa = a.words.get(i).copied().unwrap_or(0);
            let wb = b.words.get(i).copied().unwrap_or(0);
            let w = wa & wb;
            size += popcount(w);
            words.push(w);
        }
        truncate_trailing_zero_words(&mut words);
        let max_doc_id = max_of(a.max_doc_id, b.max_doc_id);
        Self { words, size, max_doc_id }
    }

    /// Word-wise OR over `max(len(a), len(b))` words.
    #[must_use]
    pub fn union(a: &Self, b: &Self) -> Self {
        let len = a.words.len().max(b.words.len());
        let mut words = Vec::with_capacity(len);
        let mut size = 0usize;
        for i in 0..len {
            let wa = a.words.get(i).copied().unwrap_or(0);
            let wb = b.words.get(i).copied().unwrap_or(0);
            let w = wa | wb;
            size += popcount(w);
            words.push(w);
        }
        let max_doc_id = max_of(a.max_doc_id, b.max_doc_id);
        Self { words, size, max_doc_id }
    }

    fn locate(id: u64) -> (usize, u32) {
        let word_idx = (id / u64::from(WORD_BITS)) as usize;
        let bit = (id % u64::from(WORD_BITS)) as u32;
        (word_idx, bit)
    }
}

fn popcount(mut x: u32) -> usize {
    let mut count = 0;
    while x != 0 {
        x &= x - 1;
        count += 1;
    }
    count
}

fn truncate_trailing_zero_words(words: &mut Vec<u32>) {
    while words.last() == Some(&0) {
        words.pop();
    }
}

fn max_of(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_set_round_trips_to_set() {
        let bm = Bitmap::from_set([3, 1, 64, 40]);
        let mut v = bm.to_set();
        v.sort_unstable();
        assert_eq!(v, vec![1, 3, 40, 64]);
        assert_eq!(bm.len(), 4);
        assert_eq!(bm.max_doc_id(), Some(64));
    }

    #[test]
    fn is_empty_tracks_size() {
        let mut bm = Bitmap::new();
        assert!(bm.is_empty());
        bm.insert(5);
        assert!(!bm.is_empty());
        bm.remove(5);
        assert!(bm.is_empty());
    }

    #[test]
    fn first_returns_lowest_set_bit() {
        let bm = Bitmap::from_set([10, 2, 99]);
        assert_eq!(bm.first(), Some(2));
        assert_eq!(Bitmap::new().first(), None);
    }

    #[test]
    fn intersect_is_commutative() {
        let a = Bitmap::from_set([1, 2, 3, 64]);
        let b = Bitmap::from_set([2, 3, 4, 65]);
        assert_eq!(Bitmap::intersect(&a, &b), Bitmap::intersect(&b, &a));
    }

    #[test]
    fn union_is_commutative() {
        let a = Bitmap::from_set([1, 2, 3]);
        let b = Bitmap::from_set([4, 5, 2]);
        assert_eq!(Bitmap::union(&a, &b), Bitmap::union(&b, &a));
    }

    #[test]
    fn intersect_with_union_absorbs() {
        let a = Bitmap::from_set([1, 2, 3]);
        let b = Bitmap::from_set([4, 5, 6]);
        let u = Bitmap::union(&a, &b);
        let got = Bitmap::intersect(&a, &u);
        assert_eq!(got.to_set(), a.to_set());
    }

    #[test]
    fn popcount_matches_reference_loop() {
        for x in [0u32, 1, 0xFF, 0xFFFF_FFFF, 0xAAAA_AAAA, 12345] {
            let mut reference = x;
            let mut count = 0;
            while reference != 0 {
                reference &= reference - 1;
                count += 1;
            }
            assert_eq!(popcount(x), count);
        }
    }

    #[test]
    fn mismatched_lengths_treat_missing_words_as_zero() {
        let a = Bitmap::from_set([1000]); // forces many words
        let b = Bitmap::from_set([1]);
        let i = Bitmap::intersect(&a, &b);
        assert!(i.is_empty());
        let u = Bitmap::union(&a, &b);
        let mut v = u.to_set();
        v.sort_unstable();
        assert_eq!(v, vec![1, 1000]);
    }
}
