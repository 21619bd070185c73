//! Delta verification by ping-pong ordering.
//!
//! The two CPUs alternate TSC reads in strict lockstep: master reads, kicks
//! the worker, worker reads, kicks back. After adjusting both sample runs by
//! the deltas under test, every read must be later than the one before it.
//! A single inversion proves the assumed deltas wrong.
//!
//! Run with a worker delta of zero this doubles as the cheap pre-check that
//! lets truly synchronized TSCs skip measurement entirely.

use core::hint::spin_loop;
use core::sync::atomic::Ordering;

use super::sync::{
    master_kick_other_out_of_after, master_sync_after, sync_before, worker_sync_after,
};
use super::{state, DeltaSession, SyncSlot, VerifyOutcome, VERIFY_SAMPLES};

/// Runs the verification pass on one side of the pair. The master computes
/// and publishes the outcome; the worker reads it back after the rendezvous
/// releases it, which orders the load after the master's store.
pub(super) fn verify_delta(
    session: &DeltaSession<'_>,
    my: &SyncSlot,
    other: &SyncSlot,
    is_master: bool,
    worker_delta: i64,
) -> VerifyOutcome {
    let host = session.host;
    let synced = if is_master {
        let Some(guard) = sync_before(session, my, other, true) else {
            session.set_verify_outcome(VerifyOutcome::TimedOut);
            return VerifyOutcome::TimedOut;
        };
        let tscs = &session.master_side.verify_tscs;
        let mut i = 0;
        while i < VERIFY_SAMPLES {
            let tsc = host.read_tsc();
            other.sync_var.store(state::GO_GO, Ordering::Release);
            tscs[i].store(tsc, Ordering::Relaxed);
            while my.sync_var.load(Ordering::Acquire) == state::GO {
                spin_loop();
            }

            let tsc = host.read_tsc();
            other.sync_var.store(state::GO, Ordering::Release);
            tscs[i + 1].store(tsc, Ordering::Relaxed);
            while my.sync_var.load(Ordering::Acquire) == state::GO_GO {
                spin_loop();
            }
            i += 2;
        }
        master_sync_after(my, guard)
    } else {
        let Some(guard) = sync_before(session, my, other, false) else {
            return VerifyOutcome::TimedOut;
        };
        let tscs = &session.worker_side.verify_tscs;
        let mut i = 0;
        while i < VERIFY_SAMPLES {
            while my.sync_var.load(Ordering::Acquire) == state::GO {
                spin_loop();
            }
            let tsc = host.read_tsc();
            other.sync_var.store(state::GO_GO, Ordering::Release);
            tscs[i].store(tsc, Ordering::Relaxed);

            while my.sync_var.load(Ordering::Acquire) == state::GO_GO {
                spin_loop();
            }
            let tsc = host.read_tsc();
            other.sync_var.store(state::GO, Ordering::Release);
            tscs[i + 1].store(tsc, Ordering::Relaxed);
            i += 2;
        }
        worker_sync_after(my, other, guard)
    };

    if !synced {
        if is_master {
            session.set_verify_outcome(VerifyOutcome::TimedOut);
            let _ = master_kick_other_out_of_after(other);
        }
        return VerifyOutcome::TimedOut;
    }

    if is_master {
        let outcome = check_ordering(session, worker_delta);
        session.set_verify_outcome(outcome);
        let _ = master_kick_other_out_of_after(other);
        outcome
    } else {
        session.verify_outcome()
    }
}

/// Merges the two adjusted sample runs and checks strict interleaved
/// ordering: master[i] <= worker[i] <= master[i+1] for every i.
fn check_ordering(session: &DeltaSession<'_>, worker_delta: i64) -> VerifyOutcome {
    let master_delta = session.master.tsc_delta();
    let mut prev_worker: u64 = 0;
    for i in 0..VERIFY_SAMPLES {
        let master_tsc = session.master_side.verify_tscs[i]
            .load(Ordering::Relaxed)
            .wrapping_sub(master_delta as u64);
        if i > 0 && (master_tsc.wrapping_sub(prev_worker) as i64) < 0 {
            return VerifyOutcome::OutOfRange;
        }
        let worker_tsc = session.worker_side.verify_tscs[i]
            .load(Ordering::Relaxed)
            .wrapping_sub(worker_delta as u64);
        if (worker_tsc.wrapping_sub(master_tsc) as i64) < 0 {
            return VerifyOutcome::OutOfRange;
        }
        prev_worker = worker_tsc;
    }
    VerifyOutcome::Confirmed
}
