//! Two-CPU rendezvous handshake.
//!
//! Each round of sampling is bracketed by `sync_before` and `sync_after`.
//! `sync_before` walks both sides through READY -> STEADY -> GO with
//! interrupts disabled, then runs a bounded lockstep exchange on the sync
//! sequence counters until both CPUs observe each other within one exchange,
//! which is as close to "simultaneous" as two cores get. `sync_after`
//! restores interrupts and parks until the master hands out the next READY.
//!
//! All state transitions are CAS so a partner that timed out and stomped the
//! state is detected rather than raced.

use core::hint::spin_loop;
use core::sync::atomic::Ordering;

use gip_host::IrqGuard;

use super::{state, DeltaSession, SyncSlot, SYNC_SEQ_GAVE_UP};

/// Iterations of the STEADY wait between timeout probes.
const TIMEOUT_CHECK_INTERVAL: u32 = 0x40;

/// How many lockstep exchanges past the starting sequence to attempt before
/// giving up and proceeding anyway.
const LOCKSTEP_ROUNDS: u32 = 16;

#[inline]
fn cas(slot: &SyncSlot, from: u32, to: u32) -> bool {
    slot.sync_var
        .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Enters a measurement round. On success interrupts are disabled on this
/// CPU and both sides are in GO; the returned guard must be handed to
/// [`master_sync_after`] / [`worker_sync_after`]. `None` means the round (and
/// the whole measurement loop) must be abandoned.
pub(super) fn sync_before(
    session: &DeltaSession<'_>,
    my: &SyncSlot,
    other: &SyncSlot,
    is_master: bool,
) -> Option<IrqGuard> {
    if is_master {
        // Flip the worker out of its READY park; failure means it already
        // timed out or went FINAL on us.
        if !cas(other, state::READY, state::STEADY) {
            return None;
        }
    }

    my.sync_seq.store(0, Ordering::Release);

    // Wait to be flipped to STEADY ourselves, re-enabling interrupts between
    // probes so a pending IPI cannot deadlock the pair.
    let mut iterations: u32 = 0;
    let guard = loop {
        let guard = session.host.disable_interrupts();
        let v = my.sync_var.load(Ordering::Acquire);
        if v == state::STEADY {
            break guard;
        }
        drop(guard);
        if v != state::READY {
            return None;
        }
        iterations = iterations.wrapping_add(1);
        if iterations % TIMEOUT_CHECK_INTERVAL == 0 && my.expired(session.host.read_tsc()) {
            // Park both sides in TIMEOUT so neither spins forever on a
            // partner that is never coming.
            let _ = cas(my, state::READY, state::TIMEOUT);
            let _ = cas(other, state::STEADY, state::TIMEOUT);
            session.timed_out.store(true, Ordering::Release);
            return None;
        }
        spin_loop();
    };

    if is_master {
        if !cas(other, state::STEADY, state::GO) {
            return None;
        }
    } else if !cas(other, state::READY, state::STEADY) {
        return None;
    }

    // Both sides now advance the partner, so wait for our own GO.
    loop {
        let v = my.sync_var.load(Ordering::Acquire);
        if v == state::GO {
            break;
        }
        if v != state::STEADY {
            return None;
        }
        spin_loop();
    }

    if !is_master && !cas(other, state::STEADY, state::GO) {
        return None;
    }

    // Lockstep: repeatedly exchange sequence numbers until one exchange
    // observes the partner's current value, i.e. both CPUs executed the
    // exchange back to back. The sides start in disjoint ranges so a stale
    // observation can never look current.
    let mut my_seq: u32 = if is_master { 0 } else { 256 };
    let max_seq = my_seq + LOCKSTEP_ROUNDS;
    loop {
        my.sync_seq.store(my_seq, Ordering::SeqCst);
        let other_seq_sent = other.sync_seq.swap(my_seq, Ordering::SeqCst);
        let other_seq_back = my.sync_seq.load(Ordering::SeqCst);
        if other_seq_sent == other_seq_back
            || other_seq_sent == SYNC_SEQ_GAVE_UP
            || other_seq_back == SYNC_SEQ_GAVE_UP
        {
            break;
        }
        my_seq += 1;
        if my_seq >= max_seq {
            my.sync_seq.store(SYNC_SEQ_GAVE_UP, Ordering::SeqCst);
            break;
        }
        spin_loop();
    }

    Some(guard)
}

/// Leaves a measurement round: restores interrupts, then parks until the
/// master re-arms READY for the next round. The worker also accepts STEADY,
/// covering the race where the master already kicked off the next round.
fn sync_after_wait(my: &SyncSlot, is_master: bool) -> bool {
    loop {
        let v = my.sync_var.load(Ordering::Acquire);
        if v == state::READY {
            return true;
        }
        if !is_master && v == state::STEADY {
            return true;
        }
        if v != state::GO {
            return false;
        }
        spin_loop();
    }
}

pub(super) fn master_sync_after(my: &SyncSlot, guard: IrqGuard) -> bool {
    drop(guard);
    sync_after_wait(my, true)
}

/// The master releases the worker for the next round after it has finished
/// its between-rounds processing.
pub(super) fn master_kick_other_out_of_after(other: &SyncSlot) -> bool {
    cas(other, state::GO, state::READY)
}

pub(super) fn worker_sync_after(my: &SyncSlot, other: &SyncSlot, guard: IrqGuard) -> bool {
    drop(guard);
    if !cas(other, state::GO, state::READY) {
        return false;
    }
    sync_after_wait(my, false)
}
