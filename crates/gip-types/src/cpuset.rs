use core::sync::atomic::{AtomicU64, Ordering};

use crate::CpuSetIndex;

/// Highest CPU-set index representable, matching the bounded CPU tables.
pub const CPU_SET_CAPACITY: usize = 256;

const WORDS: usize = CPU_SET_CAPACITY / 64;

/// Atomic bitset over CPU-set indices.
///
/// Readers may race with MP-event updates; all accesses are relaxed since the
/// set only gates best-effort decisions (counts, sweep scheduling) and every
/// consumer re-validates per-CPU state afterwards.
#[derive(Debug, Default)]
pub struct CpuSet {
    words: [AtomicU64; WORDS],
}

impl CpuSet {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { words: [ZERO; WORDS] }
    }

    #[inline]
    pub fn contains(&self, index: CpuSetIndex) -> bool {
        if index >= CPU_SET_CAPACITY {
            return false;
        }
        self.words[index / 64].load(Ordering::Relaxed) & (1 << (index % 64)) != 0
    }

    /// Sets the bit, returning whether it was previously set.
    #[inline]
    pub fn set(&self, index: CpuSetIndex) -> bool {
        assert!(index < CPU_SET_CAPACITY, "cpu set index {index} out of range");
        let prev = self.words[index / 64].fetch_or(1 << (index % 64), Ordering::Relaxed);
        prev & (1 << (index % 64)) != 0
    }

    /// Clears the bit, returning whether it was previously set.
    #[inline]
    pub fn clear(&self, index: CpuSetIndex) -> bool {
        assert!(index < CPU_SET_CAPACITY, "cpu set index {index} out of range");
        let prev = self.words[index / 64].fetch_and(!(1 << (index % 64)), Ordering::Relaxed);
        prev & (1 << (index % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Iterates over set indices, snapshotting each word as it goes.
    pub fn iter(&self) -> impl Iterator<Item = CpuSetIndex> + '_ {
        (0..WORDS).flat_map(move |w| {
            let word = self.words[w].load(Ordering::Relaxed);
            (0..64).filter_map(move |bit| {
                if word & (1 << bit) != 0 {
                    Some(w * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

impl Clone for CpuSet {
    fn clone(&self) -> Self {
        let out = CpuSet::new();
        for (dst, src) in out.words.iter().zip(&self.words) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_round_trip() {
        let set = CpuSet::new();
        assert!(!set.set(3));
        assert!(set.set(3));
        assert!(set.contains(3));
        assert_eq!(set.count(), 1);
        assert!(set.clear(3));
        assert!(!set.clear(3));
        assert!(set.is_empty());
    }

    #[test]
    fn iter_yields_indices_across_words() {
        let set = CpuSet::new();
        for idx in [0, 63, 64, 130, 255] {
            set.set(idx);
        }
        let got: Vec<_> = set.iter().collect();
        assert_eq!(got, vec![0, 63, 64, 130, 255]);
    }

    #[test]
    fn out_of_range_contains_is_false() {
        let set = CpuSet::new();
        assert!(!set.contains(CPU_SET_CAPACITY));
        assert!(!set.contains(usize::MAX));
    }
}
