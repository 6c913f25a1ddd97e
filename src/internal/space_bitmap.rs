use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use std::mem::size_of;

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

/// Fixed-size bitmap over the atoms (or slots) of one block.
///
/// Concurrent tracing threads may race on [`SpaceBitmap::test_and_set`];
/// every other mutating method assumes a single writer and must not overlap
/// with marking (in particular `clear_all` runs only during the clear-marks
/// phase).
pub struct SpaceBitmap {
    words: Box<[Atomic<usize>]>,
    bits: usize,
}

impl SpaceBitmap {
    pub fn new(bits: usize) -> Self {
        let count = (bits + BITS_PER_INTPTR - 1) / BITS_PER_INTPTR;
        let words = (0..count).map(|_| Atomic::new(0usize)).collect();
        Self { words, bits }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    fn offset_to_index(bit: usize) -> usize {
        bit / BITS_PER_INTPTR
    }

    #[inline]
    fn offset_to_mask(bit: usize) -> usize {
        1 << (bit % BITS_PER_INTPTR)
    }

    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits, "bit {} out of range {}", bit, self.bits);
        (self.words[Self::offset_to_index(bit)].load(Ordering::Relaxed) & Self::offset_to_mask(bit))
            != 0
    }

    /// Lock-free set; returns whether the bit was already set.
    #[inline]
    pub fn test_and_set(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits);
        let atomic_entry = &self.words[Self::offset_to_index(bit)];
        let mask = Self::offset_to_mask(bit);
        let mut old_word;
        while {
            old_word = atomic_entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return true;
            }
            atomic_entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}

        false
    }

    #[inline]
    fn modify<const SET_BIT: bool>(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits);
        let atomic_entry = &self.words[Self::offset_to_index(bit)];
        let mask = Self::offset_to_mask(bit);
        let old_word = atomic_entry.load(Ordering::Relaxed);
        if SET_BIT {
            if (old_word & mask) == 0 {
                atomic_entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            atomic_entry.store(old_word & !mask, Ordering::Relaxed);
        }
        (old_word & mask) != 0
    }

    #[inline(always)]
    pub fn set(&self, bit: usize) -> bool {
        self.modify::<true>(bit)
    }

    #[inline(always)]
    pub fn clear(&self, bit: usize) -> bool {
        self.modify::<false>(bit)
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn set_all(&self) {
        for bit in 0..self.bits {
            self.set(bit);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Visit set bits in ascending order.
    ///
    /// NOTE: bits may be changed while visiting since each word is loaded
    /// once before its bits are visited.
    pub fn visit_set_bits(&self, mut visitor: impl FnMut(usize)) {
        for (index, word) in self.words.iter().enumerate() {
            let mut w = word.load(Ordering::Relaxed);
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                visitor(index * BITS_PER_INTPTR + shift);
                w ^= 1 << shift;
            }
        }
    }
}

impl fmt::Debug for SpaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceBitmap[bits={}, set={}]", self.bits, self.count())
    }
}
