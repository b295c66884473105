//! Growable bitsets over component type indices.
//!
//! A [`BitMask`] is the unit of type-set comparison: every segment is keyed by
//! one, and every entity carries the mask of the components attached to it.
//! Trailing zero words are always trimmed so that derived equality and hashing
//! are structural (two masks with the same bits set compare equal regardless
//! of how they grew).

use serde::{Deserialize, Serialize};
use std::fmt;

const BITS: usize = u64::BITS as usize;

/// A growable set of small integers.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "Vec<usize>", from = "Vec<usize>")]
pub struct BitMask {
    words: Vec<u64>,
}

impl BitMask {
    /// Create an empty mask.
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create a mask with a single bit set.
    pub fn with(index: usize) -> Self {
        let mut mask = Self::new();
        mask.add(index);
        mask
    }

    #[inline]
    fn locate(index: usize) -> (usize, u64) {
        (index / BITS, 1u64 << (index % BITS))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    /// Whether bit `index` is set.
    #[inline]
    pub fn has(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Set bit `index`. Returns `true` if it was not already set.
    pub fn add(&mut self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let added = self.words[word] & bit == 0;
        self.words[word] |= bit;
        added
    }

    /// Clear bit `index`. Returns `true` if it was set.
    pub fn remove(&mut self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        match self.words.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                self.trim();
                true
            }
            _ => false,
        }
    }

    /// Union `other` into `self`. Returns `true` if any bit changed.
    pub fn add_all(&mut self, other: &BitMask) -> bool {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (left, right) in self.words.iter_mut().zip(&other.words) {
            changed |= *right & !*left != 0;
            *left |= right;
        }
        changed
    }

    /// Remove every bit of `other` from `self`. Returns `true` if any bit changed.
    pub fn remove_all(&mut self, other: &BitMask) -> bool {
        let mut changed = false;
        for (left, right) in self.words.iter_mut().zip(&other.words) {
            changed |= *left & right != 0;
            *left &= !right;
        }
        self.trim();
        changed
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn has_all(&self, other: &BitMask) -> bool {
        other.words.iter().enumerate().all(|(i, right)| {
            let left = self.words.get(i).copied().unwrap_or(0);
            left & right == *right
        })
    }

    /// Whether at least one bit of `other` is set in `self`.
    pub fn has_any(&self, other: &BitMask) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(left, right)| left & right != 0)
    }

    /// Whether no bit of `other` is set in `self`.
    pub fn has_none(&self, other: &BitMask) -> bool {
        !self.has_any(other)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of bits set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Iterate over set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * BITS + offset)
            })
        })
    }
}

impl FromIterator<usize> for BitMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = BitMask::new();
        for index in iter {
            mask.add(index);
        }
        mask
    }
}

impl From<Vec<usize>> for BitMask {
    fn from(indices: Vec<usize>) -> Self {
        indices.into_iter().collect()
    }
}

impl From<BitMask> for Vec<usize> {
    fn from(mask: BitMask) -> Self {
        mask.iter().collect()
    }
}

impl fmt::Debug for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitMask(")?;
        f.debug_list().entries(self.iter()).finish()?;
        write!(f, ")")
    }
}
