//! # Signatures
//!
//! A signature is a growable bitset over component type ids. Bit `i` is set
//! iff the owning archetype stores component type `i`.
//!
//! ## Canonical form
//!
//! Two signatures are equal when their words are equal once trailing
//! all-zero words are dropped. The trimmed word sequence is the archetype's
//! identity key ([`SignatureKey`]), so a signature allocated with spare words
//! lands on the same archetype as a tightly sized one.
//!
//! ## Matching
//!
//! ```text
//! required:  0b0110      candidate: 0b1110   (c & r) == r   -> superset ok
//! forbidden: 0b0001                          (c & f) == 0   -> disjoint ok
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use super::component::ComponentTypeId;

const WORD_BITS: usize = 64;

/// Bitset of component type ids.
#[derive(Clone, Debug, Default)]
pub struct Signature {
    /// Bit words, lowest ids first. May carry trailing zero words.
    words: Vec<u64>,
}

impl Signature {
    /// Creates an empty signature.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Creates an empty signature with `word_count` zeroed words allocated.
    #[must_use]
    pub fn with_words(word_count: usize) -> Self {
        Self {
            words: vec![0; word_count],
        }
    }

    /// Builds a signature from a set of component type ids.
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = ComponentTypeId>,
    {
        let mut signature = Self::new();
        for id in ids {
            signature.insert(id);
        }
        signature
    }

    /// Sets the bit for `id`, growing the word vector when needed.
    pub fn insert(&mut self, id: ComponentTypeId) {
        let (word, bit) = split(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    /// Clears the bit for `id`. Words are never shrunk here.
    pub fn remove(&mut self, id: ComponentTypeId) {
        let (word, bit) = split(id);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << bit);
        }
    }

    /// Returns a copy with `id` added.
    #[must_use]
    pub fn with(&self, id: ComponentTypeId) -> Self {
        let mut next = self.clone();
        next.insert(id);
        next
    }

    /// Returns a copy with `id` removed.
    #[must_use]
    pub fn without(&self, id: ComponentTypeId) -> Self {
        let mut next = self.clone();
        next.remove(id);
        next
    }

    /// Checks whether `id` is set.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        let (word, bit) = split(id);
        (self.words.get(word).copied().unwrap_or(0) >> bit) & 1 == 1
    }

    /// Raw words, including any trailing zero words.
    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Words with trailing zero words dropped.
    #[must_use]
    pub fn canonical_words(&self) -> &[u64] {
        let end = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |last| last + 1);
        &self.words[..end]
    }

    /// Returns the identity key for this signature.
    #[must_use]
    pub fn key(&self) -> SignatureKey {
        SignatureKey(self.canonical_words().into())
    }

    /// Number of component types in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Checks if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterates set ids in ascending order.
    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter {
            words: &self.words,
            word_idx: 0,
            current_word: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Checks `(self & required) == required` word by word.
    ///
    /// Words of `required` past the end of `self` must be zero.
    #[must_use]
    pub fn is_superset_of(&self, required: &Self) -> bool {
        required.words.iter().enumerate().all(|(i, &r)| {
            let s = self.words.get(i).copied().unwrap_or(0);
            s & r == r
        })
    }

    /// Checks `(self & forbidden) == 0` over the words both sides have.
    ///
    /// Forbidden bits past the end of `self` can never match.
    #[must_use]
    pub fn is_disjoint_from(&self, forbidden: &Self) -> bool {
        self.words
            .iter()
            .zip(forbidden.words.iter())
            .all(|(&s, &f)| s & f == 0)
    }

    /// Query match: superset of `required` and disjoint from `forbidden`.
    #[inline]
    #[must_use]
    pub fn matches(&self, required: &Self, forbidden: &Self) -> bool {
        self.is_superset_of(required) && self.is_disjoint_from(forbidden)
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_words() == other.canonical_words()
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_words().hash(state);
    }
}

impl FromIterator<ComponentTypeId> for Signature {
    fn from_iter<I: IntoIterator<Item = ComponentTypeId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl<'a> IntoIterator for &'a Signature {
    type Item = ComponentTypeId;
    type IntoIter = SignatureIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the ids set in a [`Signature`].
pub struct SignatureIter<'a> {
    words: &'a [u64],
    word_idx: usize,
    current_word: u64,
}

impl Iterator for SignatureIter<'_> {
    type Item = ComponentTypeId;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word != 0 {
                let bit = self.current_word.trailing_zeros() as usize;
                self.current_word &= self.current_word - 1;
                return Some(join(self.word_idx, bit));
            }

            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current_word = self.words[self.word_idx];
        }
    }
}

/// Canonical identity of a signature: its words without trailing zeros.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureKey(Box<[u64]>);

impl SignatureKey {
    /// The canonical words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.0
    }
}

impl fmt::Display for SignatureKey {
    /// Highest word first, hex, `:`-separated. The empty set prints as `0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("0");
        }
        for (i, word) in self.0.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{word:016x}")?;
        }
        Ok(())
    }
}

#[inline]
fn split(id: ComponentTypeId) -> (usize, usize) {
    let raw = id.index();
    (raw / WORD_BITS, raw % WORD_BITS)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn join(word: usize, bit: usize) -> ComponentTypeId {
    ComponentTypeId::new((word * WORD_BITS + bit) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Signature {
        raw.iter().map(|&r| ComponentTypeId::new(r)).collect()
    }

    #[test]
    fn test_insert_contains_remove() {
        let mut sig = Signature::new();
        sig.insert(ComponentTypeId::new(3));
        sig.insert(ComponentTypeId::new(130));
        assert!(sig.contains(ComponentTypeId::new(3)));
        assert!(sig.contains(ComponentTypeId::new(130)));
        assert!(!sig.contains(ComponentTypeId::new(4)));
        assert_eq!(sig.words().len(), 3);
        assert_eq!(sig.len(), 2);

        sig.remove(ComponentTypeId::new(130));
        assert!(!sig.contains(ComponentTypeId::new(130)));
        assert_eq!(sig.canonical_words().len(), 1);
    }

    #[test]
    fn test_canonical_key_ignores_trailing_zero_words() {
        let mut padded = Signature::with_words(8);
        padded.insert(ComponentTypeId::new(1));
        padded.insert(ComponentTypeId::new(65));
        let tight = ids(&[1, 65]);

        assert_eq!(padded.key(), tight.key());
        assert_eq!(padded, tight);
        assert_eq!(Signature::with_words(4).key(), Signature::new().key());
        assert_eq!(Signature::new().key().to_string(), "0");
    }

    #[test]
    fn test_iter_ascending() {
        let sig = ids(&[70, 2, 64, 0]);
        let collected: Vec<u32> = sig.iter().map(ComponentTypeId::raw).collect();
        assert_eq!(collected, vec![0, 2, 64, 70]);
    }

    #[test]
    fn test_matching_superset_and_disjoint() {
        let candidate = ids(&[0, 1, 2]);
        assert!(candidate.matches(&ids(&[0, 1]), &Signature::new()));
        assert!(!candidate.matches(&ids(&[0, 3]), &Signature::new()));
        assert!(!candidate.matches(&ids(&[0]), &ids(&[2])));
        assert!(candidate.matches(&ids(&[0]), &ids(&[5])));
    }

    #[test]
    fn test_required_words_beyond_candidate() {
        let candidate = ids(&[1]);
        // Required with an extra zero word still matches.
        let mut required = Signature::with_words(3);
        required.insert(ComponentTypeId::new(1));
        assert!(candidate.matches(&required, &Signature::new()));
        // A real bit beyond the candidate's words fails.
        assert!(!candidate.matches(&ids(&[1, 200]), &Signature::new()));
    }

    #[test]
    fn test_forbidden_words_beyond_candidate_are_vacuous() {
        let candidate = ids(&[1]);
        assert!(candidate.matches(&Signature::new(), &ids(&[300])));
    }

    #[test]
    fn test_matching_exhaustive_small_universe() {
        // Every (required, forbidden, candidate) over 4 ids.
        for c in 0u32..16 {
            for r in 0u32..16 {
                for f in 0u32..16 {
                    let set = |mask: u32| -> Signature {
                        (0..4).filter(|b| mask >> b & 1 == 1).map(ComponentTypeId::new).collect()
                    };
                    let expected = (c & r) == r && (c & f) == 0;
                    assert_eq!(set(c).matches(&set(r), &set(f)), expected, "c={c} r={r} f={f}");
                }
            }
        }
    }
}
