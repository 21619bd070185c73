//! Sequence-locked snapshot cell for the per-CPU clock data.
//!
//! The transaction counter starts at 2 and is incremented at the start and
//! end of every update: odd means an update is in flight, even means the data
//! is stable. Readers retry until they observe the same even count on both
//! sides of the copy; writers are exclusive by construction (one tick engine
//! per record) but a write begun while the counter is already odd — an update
//! that never completed — is detected and repaired.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicU32, Ordering};

pub struct SeqLock<T: Copy> {
    seq: AtomicU32,
    data: UnsafeCell<T>,
}

// Readers copy the payload with volatile reads while a writer may be mid
// update; the sequence check discards any torn copy before it escapes.
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(value: T) -> Self {
        SeqLock { seq: AtomicU32::new(2), data: UnsafeCell::new(value) }
    }

    /// Current transaction count. Even iff no update is in flight.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Overwrites the transaction count. Only for lifecycle transitions
    /// (record re-init, update-frequency boundary bumps) while the tick
    /// engine is known to be quiescent.
    pub fn set_sequence(&self, seq: u32) {
        self.seq.store(seq, Ordering::Release);
    }

    /// Takes a consistent snapshot, retrying across concurrent updates.
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            core::hint::spin_loop();
        }
    }

    /// Single snapshot attempt; `None` if an update was in flight or raced.
    pub fn try_read(&self) -> Option<T> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 != 0 {
            return None;
        }
        // SAFETY: a concurrent writer may be mutating the payload; the
        // volatile copy never observes that as UB-visible state because the
        // sequence re-check below throws the copy away unless both loads saw
        // the same even count.
        let value = unsafe { core::ptr::read_volatile(self.data.get()) };
        fence(Ordering::Acquire);
        (self.seq.load(Ordering::Relaxed) == s1).then_some(value)
    }

    /// Opens an update transaction. Never blocks: the caller is the only
    /// writer. If the counter was already odd the previous update never
    /// committed; the guard realigns parity and reports it via
    /// [`WriteGuard::recovered`].
    pub fn begin_write(&self) -> WriteGuard<'_, T> {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        let recovered = prev & 1 != 0;
        if recovered {
            self.seq.fetch_add(1, Ordering::AcqRel);
        }
        fence(Ordering::Release);
        WriteGuard { lock: self, recovered }
    }
}

impl<T: Copy + core::fmt::Debug> core::fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SeqLock").field("seq", &self.sequence()).field("data", &self.read()).finish()
    }
}

/// Open update transaction; committing (closing the odd window) on drop.
pub struct WriteGuard<'a, T: Copy> {
    lock: &'a SeqLock<T>,
    recovered: bool,
}

impl<T: Copy> WriteGuard<'_, T> {
    /// Whether this write found the previous transaction unfinished.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl<T: Copy> core::ops::Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: exclusive writer for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: Copy> core::ops::DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive writer for the guard's lifetime.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Copy> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.seq.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn sequence_starts_at_two_and_advances_by_two_per_write() {
        let lock = SeqLock::new(0u64);
        assert_eq!(lock.sequence(), 2);
        {
            let mut w = lock.begin_write();
            assert!(!w.recovered());
            *w = 7;
            assert_eq!(lock.sequence(), 3);
        }
        assert_eq!(lock.sequence(), 4);
        assert_eq!(lock.read(), 7);
    }

    #[test]
    fn try_read_refuses_mid_write_state() {
        let lock = SeqLock::new(1u32);
        let guard = lock.begin_write();
        assert!(lock.try_read().is_none());
        drop(guard);
        assert_eq!(lock.try_read(), Some(1));
    }

    #[test]
    fn stale_odd_sequence_is_recovered() {
        let lock = SeqLock::new(0u32);
        lock.set_sequence(5);
        let guard = lock.begin_write();
        assert!(guard.recovered());
        drop(guard);
        assert_eq!(lock.sequence() & 1, 0);
        assert_eq!(lock.read(), 0);
    }

    #[test]
    fn readers_never_observe_torn_pairs() {
        // Writer keeps the two halves equal; any torn read breaks that.
        let lock = Arc::new(SeqLock::new((0u64, 0u64)));
        let stop = Arc::new(AtomicBool::new(false));

        let w_lock = Arc::clone(&lock);
        let w_stop = Arc::clone(&stop);
        let writer = std::thread::spawn(move || {
            let mut i = 0u64;
            while !w_stop.load(Ordering::Relaxed) {
                i += 1;
                let mut g = w_lock.begin_write();
                g.0 = i;
                g.1 = i.wrapping_mul(3);
            }
        });

        let mut readers = Vec::new();
        for _ in 0..3 {
            let r_lock = Arc::clone(&lock);
            let r_stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                while !r_stop.load(Ordering::Relaxed) {
                    let (a, b) = r_lock.read();
                    assert_eq!(b, a.wrapping_mul(3), "torn read: a={a} b={b}");
                }
            }));
        }

        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn read_returns_last_committed_write(values in proptest::collection::vec(any::<u64>(), 1..64)) {
                let lock = SeqLock::new(0u64);
                for &v in &values {
                    *lock.begin_write() = v;
                }
                prop_assert_eq!(lock.read(), *values.last().unwrap());
                prop_assert_eq!(lock.sequence(), 2 + 2 * values.len() as u32);
            }
        }
    }
}
