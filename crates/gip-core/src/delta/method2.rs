//! Measurement method 2: sequence-tagged sample rings.
//!
//! Both CPUs race through a ring of 64 entries, each entry recording the
//! side's own sequence number, the partner's sequence as observed just
//! before the TSC read, and the TSC itself. The own sequence is bumped twice
//! per entry so an odd observation identifies exactly which partner entry
//! was mid-flight. After the round the master pairs up entries that observed
//! each other and folds their TSC differences into the delta estimate; a
//! result is only committed once enough pairs matched.
//!
//! A lag schedule staggers the two loops across rounds so the rings drift
//! through different interleavings instead of locking into one phase.

use core::hint::spin_loop;
use core::sync::atomic::Ordering;

use gip_types::TSC_DELTA_UNKNOWN;

use super::sync::{
    master_kick_other_out_of_after, master_sync_after, sync_before, worker_sync_after,
};
use super::{better_delta_candidate, DeltaSession, SideData, SyncSlot, M2_ENTRIES, M2_LOOPS};

/// Matched pairs required before a round's best candidate is committed.
const MIN_HITS: u32 = 3;

/// Pause iterations inserted per entry when this side is lagging.
const LAG_SPINS: u32 = 32;

fn collect(session: &DeltaSession<'_>, my_side: &SideData, other_side: &SideData) {
    let host = session.host;
    let lag = my_side.m2_lag.load(Ordering::Acquire);
    my_side.m2_seq.store(0, Ordering::SeqCst);
    for entry in my_side.m2_entries.iter() {
        let seq_mine = my_side.m2_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let seq_other = other_side.m2_seq.load(Ordering::SeqCst);
        let tsc = host.read_tsc();
        my_side.m2_seq.fetch_add(1, Ordering::SeqCst);
        entry.seq_mine.store(seq_mine, Ordering::SeqCst);
        entry.seq_other.store(seq_other, Ordering::SeqCst);
        entry.tsc.store(tsc, Ordering::SeqCst);
        if lag {
            for _ in 0..LAG_SPINS {
                spin_loop();
            }
        }
    }
}

/// Pairs up master entries with the worker entries they observed mid-flight
/// and folds the differences. Commits to the worker record only on enough
/// corroboration.
fn process_on_master(session: &DeltaSession<'_>) {
    let master_delta = session.master.tsc_delta();
    let mut best = session.worker.tsc_delta.load(Ordering::SeqCst);
    // Hits are per round: three coherent pairs scattered over noisy rounds
    // corroborate nothing.
    let mut hits = 0u32;
    for master_entry in session.master_side.m2_entries.iter() {
        let seq_other = master_entry.seq_other.load(Ordering::Relaxed);
        if seq_other & 1 == 0 {
            continue;
        }
        let idx = (seq_other >> 1) as usize;
        if idx >= M2_ENTRIES {
            continue;
        }
        let worker_entry = &session.worker_side.m2_entries[idx];
        if worker_entry.seq_other.load(Ordering::Relaxed)
            != master_entry.seq_mine.load(Ordering::Relaxed)
        {
            continue;
        }
        let master_tsc = master_entry
            .tsc
            .load(Ordering::Relaxed)
            .wrapping_sub(master_delta as u64);
        let candidate = worker_entry
            .tsc
            .load(Ordering::Relaxed)
            .wrapping_sub(master_tsc) as i64;
        if better_delta_candidate(best, candidate) {
            best = candidate;
        }
        hits += 1;
    }
    if hits >= MIN_HITS && best != TSC_DELTA_UNKNOWN {
        session.worker.tsc_delta.store(best, Ordering::SeqCst);
    }
}

/// Lag schedule for a round: no lag in the first quarter, both lagging in
/// the second, then the sides alternating.
fn schedule_lag(session: &DeltaSession<'_>, round: u32) {
    let (master_lag, worker_lag) = if round < M2_LOOPS / 4 {
        (false, false)
    } else if round < M2_LOOPS / 2 {
        (true, true)
    } else {
        (round & 1 == 0, round & 1 == 1)
    };
    session.master_side.m2_lag.store(master_lag, Ordering::Release);
    session.worker_side.m2_lag.store(worker_lag, Ordering::Release);
}

pub(super) fn measure_master(session: &DeltaSession<'_>, my: &SyncSlot, other: &SyncSlot) {
    for round in 0..M2_LOOPS {
        schedule_lag(session, round);
        let Some(guard) = sync_before(session, my, other, true) else {
            break;
        };
        collect(session, &session.master_side, &session.worker_side);
        if !master_sync_after(my, guard) {
            break;
        }
        process_on_master(session);
        if !master_kick_other_out_of_after(other) {
            break;
        }
    }
}

pub(super) fn measure_worker(session: &DeltaSession<'_>, my: &SyncSlot, other: &SyncSlot) {
    for _ in 0..M2_LOOPS {
        let Some(guard) = sync_before(session, my, other, false) else {
            break;
        };
        collect(session, &session.worker_side, &session.master_side);
        if !worker_sync_after(my, other, guard) {
            break;
        }
    }
}
