use std::fmt;

use serde::{Deserialize, Serialize};

/// A bitset over a fixed number of bits with a compact "everything is set"
/// form.
///
/// The complete shape stores only the bit count; the partial shape carries an
/// explicit bitmap. Setting the last clear bit of a partial set promotes it
/// to complete.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiniteBitSet {
    Complete {
        count: u32,
    },
    Partial {
        count: u32,
        words: Vec<u64>,
        set: u32,
    },
}

impl FiniteBitSet {
    /// A set of `count` bits, none of them set. Zero bits is trivially
    /// complete.
    pub fn empty(count: u32) -> Self {
        if count == 0 {
            return Self::Complete { count };
        }
        let words = vec![0u64; count.div_ceil(64) as usize];
        Self::Partial {
            count,
            words,
            set: 0,
        }
    }

    pub fn complete(count: u32) -> Self {
        Self::Complete { count }
    }

    pub fn count(&self) -> u32 {
        match self {
            Self::Complete { count } | Self::Partial { count, .. } => *count,
        }
    }

    pub fn num_set(&self) -> u32 {
        match self {
            Self::Complete { count } => *count,
            Self::Partial { set, .. } => *set,
        }
    }

    pub fn is_set(&self, index: u32) -> bool {
        assert!(index < self.count(), "bit index out of range");
        match self {
            Self::Complete { .. } => true,
            Self::Partial { words, .. } => {
                words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
            }
        }
    }

    pub fn are_all_set(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Returns a set with the given bit additionally set, promoting to the
    /// complete shape exactly when every bit is now set.
    #[must_use]
    pub fn set_bit(mut self, index: u32) -> Self {
        assert!(index < self.count(), "bit index out of range");
        if let Self::Partial { count, words, set } = &mut self {
            let word = &mut words[(index / 64) as usize];
            let mask = 1u64 << (index % 64);
            if *word & mask == 0 {
                *word |= mask;
                *set += 1;
            }
            if set == count {
                return Self::Complete { count: *count };
            }
        }
        self
    }

    /// Union of two sets over the same bit count.
    #[must_use]
    pub fn union(self, other: &FiniteBitSet) -> Self {
        assert_eq!(self.count(), other.count(), "bit count mismatch");
        match (self, other) {
            (done @ Self::Complete { .. }, _) => done,
            (_, Self::Complete { count }) => Self::Complete { count: *count },
            (
                Self::Partial {
                    count,
                    mut words,
                    set: _,
                },
                Self::Partial {
                    words: other_words, ..
                },
            ) => {
                for (word, other) in words.iter_mut().zip(other_words) {
                    *word |= other;
                }
                let set = words.iter().map(|w| w.count_ones()).sum();
                if set == count {
                    Self::Complete { count }
                } else {
                    Self::Partial { count, words, set }
                }
            }
        }
    }

    /// Indexes of the set bits, in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count()).filter(move |index| self.is_set(*index))
    }
}

impl fmt::Debug for FiniteBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete { count } => write!(f, "Complete[{count}]"),
            Self::Partial { count, set, .. } => write!(f, "Partial[{set}/{count}]"),
        }
    }
}
