//! Measurement method 1: master-published samples, worker latency filter.
//!
//! Each round the master publishes one TSC sample through the shared record
//! and the worker spins reading it, timestamping both the moment it saw the
//! sample and the moment the read completed. A primer phase warms caches,
//! then a window calibrates the worker's minimum observed read latency, and
//! only worker samples whose read latency stayed under twice that minimum
//! are allowed to produce a delta candidate. The candidate closest to zero
//! from either side wins.

use core::hint::spin_loop;
use core::sync::atomic::Ordering;

use gip_types::TSC_SAMPLE_RESERVED;

use super::sync::{
    master_kick_other_out_of_after, master_sync_after, sync_before, worker_sync_after,
};
use super::{
    better_delta_candidate, DeltaSession, SyncSlot, M1_LOOPS, M1_PRIMER_LOOPS, M1_READ_TIME_LOOPS,
};

pub(super) fn measure_master(session: &DeltaSession<'_>, my: &SyncSlot, other: &SyncSlot) {
    let host = session.host;
    let master_delta = session.master.tsc_delta();
    for round in 0..M1_LOOPS {
        let Some(guard) = sync_before(session, my, other, true) else {
            break;
        };

        // Publish a sample; re-read on the astronomically unlikely chance the
        // counter hit the reserved value.
        loop {
            let tsc = host.read_tsc();
            session.master.tsc_sample.store(tsc, Ordering::SeqCst);
            if tsc != TSC_SAMPLE_RESERVED {
                break;
            }
        }

        if !master_sync_after(my, guard) {
            break;
        }

        if round > M1_PRIMER_LOOPS + M1_READ_TIME_LOOPS {
            let worker_tsc = session.worker.tsc_sample.load(Ordering::SeqCst);
            if worker_tsc != TSC_SAMPLE_RESERVED {
                let master_tsc = session.master.tsc_sample.load(Ordering::SeqCst);
                let candidate =
                    worker_tsc.wrapping_sub(master_tsc.wrapping_sub(master_delta as u64)) as i64;
                if better_delta_candidate(session.worker.tsc_delta.load(Ordering::Relaxed), candidate)
                {
                    session.worker.tsc_delta.store(candidate, Ordering::SeqCst);
                }
            }
        }

        session
            .master
            .tsc_sample
            .store(TSC_SAMPLE_RESERVED, Ordering::SeqCst);
        if !master_kick_other_out_of_after(other) {
            break;
        }
    }
}

pub(super) fn measure_worker(session: &DeltaSession<'_>, my: &SyncSlot, other: &SyncSlot) {
    let host = session.host;
    let mut min_read_ticks = u64::MAX;
    for round in 0..M1_LOOPS {
        // Warm the cache line before the timed read below.
        let _ = session.master.tsc_sample.load(Ordering::SeqCst);

        let Some(guard) = sync_before(session, my, other, false) else {
            break;
        };

        // Spin until the master's sample lands; the last own TSC read before
        // that is the timestamp paired with it.
        let mut worker_tsc;
        loop {
            worker_tsc = host.read_tsc();
            if session.master.tsc_sample.load(Ordering::SeqCst) != TSC_SAMPLE_RESERVED {
                break;
            }
            spin_loop();
        }
        let flushed = host.read_tsc();
        let read_ticks = flushed.wrapping_sub(worker_tsc);

        if round > M1_PRIMER_LOOPS + M1_READ_TIME_LOOPS {
            // Only reads at least as tight as twice the calibrated minimum
            // may contribute; slower reads mean the pairing is mush.
            if read_ticks < min_read_ticks.wrapping_shl(1) {
                session.worker.tsc_sample.store(worker_tsc, Ordering::SeqCst);
                if read_ticks < min_read_ticks {
                    min_read_ticks = read_ticks;
                }
            } else {
                session
                    .worker
                    .tsc_sample
                    .store(TSC_SAMPLE_RESERVED, Ordering::SeqCst);
            }
        } else if round > M1_PRIMER_LOOPS {
            min_read_ticks = min_read_ticks.min(read_ticks);
        }

        if !worker_sync_after(my, other, guard) {
            break;
        }
    }
    session
        .worker
        .tsc_sample
        .store(TSC_SAMPLE_RESERVED, Ordering::SeqCst);
}
