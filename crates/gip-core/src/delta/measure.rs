//! Measurement orchestration: the per-CPU pair callback, the single-pair
//! driver with hyper-threading avoidance and confidence classification, and
//! the initial sweep that measures every online CPU against the master.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use gip_host::HostServices;
use gip_types::{CpuId, CpuSet, TscDeltaUse, TSC_DELTA_UNKNOWN, TSC_SAMPLE_RESERVED};

use super::verify::verify_delta;
use super::{
    method1, method2, state, DeltaMethod, DeltaSession, SyncSlot, VerifyOutcome, MEASURE_TRIES,
};
use crate::config::GipConfig;
use crate::error::{GipError, GipResult};
use crate::page::{GipPage, PerCpuRecord};

/// Iterations of the final-handshake wait between partner liveness probes.
const FINAL_WAIT_ONLINE_CHECK: u32 = 0x10000;

/// Set-index bookkeeping for delta measurements: which online CPUs still owe
/// a measurement and which have one.
pub struct DeltaTracking {
    pub pending: CpuSet,
    pub obtained: CpuSet,
}

impl DeltaTracking {
    pub fn new() -> DeltaTracking {
        DeltaTracking {
            pending: CpuSet::new(),
            obtained: CpuSet::new(),
        }
    }

    pub(crate) fn mark_measured(&self, set_index: usize) {
        self.pending.clear(set_index);
        self.obtained.set(set_index);
    }

    pub(crate) fn mark_unmeasured(&self, set_index: usize) {
        self.pending.set(set_index);
        self.obtained.clear(set_index);
    }

    pub(crate) fn forget(&self, set_index: usize) {
        self.pending.clear(set_index);
        self.obtained.clear(set_index);
    }
}

impl Default for DeltaTracking {
    fn default() -> Self {
        DeltaTracking::new()
    }
}

pub(crate) fn reset_samples(session: &DeltaSession<'_>, clear_worker_delta: bool) {
    session
        .master
        .tsc_sample
        .store(TSC_SAMPLE_RESERVED, Ordering::SeqCst);
    session
        .worker
        .tsc_sample
        .store(TSC_SAMPLE_RESERVED, Ordering::SeqCst);
    if clear_worker_delta {
        session
            .worker
            .tsc_delta
            .store(TSC_DELTA_UNKNOWN, Ordering::SeqCst);
    }
    session
        .verify_outcome
        .store(VerifyOutcome::Pending as u32, Ordering::SeqCst);
}

/// Unpublishes our slot, flags the whole setup as aborted and waits for the
/// partner to unpublish too so our stack slot cannot be read after return.
fn abort_sync_setup(
    session: &DeltaSession<'_>,
    my_ptr: &AtomicPtr<SyncSlot>,
    other_ptr: &AtomicPtr<SyncSlot>,
    timed_out: bool,
) {
    my_ptr.store(core::ptr::null_mut(), Ordering::Release);
    session.abort_setup.store(true, Ordering::Release);
    if timed_out {
        session.timed_out.store(true, Ordering::Release);
    }
    while !other_ptr.load(Ordering::Acquire).is_null() {
        spin_loop();
    }
}

/// The measurement body, run on both CPUs of the pair via a paired
/// cross-call. Publishes a stack-resident sync slot, handshakes with the
/// partner, runs the cheap zero-delta verification and only falls back to
/// full measurement when that fails.
pub(crate) fn measure_pair_callback(session: &DeltaSession<'_>, cpu: CpuId) {
    let is_master = cpu == session.master_cpu;
    if !is_master && cpu != session.worker_cpu {
        return;
    }
    let host = session.host;
    let partner_cpu = if is_master {
        session.worker_cpu
    } else {
        session.master_cpu
    };
    let (my_ptr, other_ptr) = if is_master {
        (&session.sync_master, &session.sync_worker)
    } else {
        (&session.sync_worker, &session.sync_master)
    };

    let my = SyncSlot::new();
    let tsc_start = host.read_tsc();
    my.tsc_start.store(tsc_start, Ordering::Relaxed);
    my.max_ticks.store(session.max_tsc_ticks, Ordering::Relaxed);
    my_ptr.store(&my as *const SyncSlot as *mut SyncSlot, Ordering::Release);

    // Wait for the partner to publish its slot.
    let other: &SyncSlot = loop {
        let p = other_ptr.load(Ordering::Acquire);
        if !p.is_null() {
            // Alive for the whole rendezvous: the owner does not return
            // until both pointers are null or the FINAL handshake is done.
            break unsafe { &*p };
        }
        if session.abort_setup.load(Ordering::Acquire) {
            my_ptr.store(core::ptr::null_mut(), Ordering::Release);
            return;
        }
        if !host.is_cpu_online(partner_cpu) {
            abort_sync_setup(session, my_ptr, other_ptr, false);
            return;
        }
        if my.expired(host.read_tsc()) {
            abort_sync_setup(session, my_ptr, other_ptr, true);
            return;
        }
        spin_loop();
    };

    // Prestart handshake: the master flips the worker to READY, then each
    // side waits to be flipped itself, the worker returning the favour.
    if is_master
        && other
            .sync_var
            .compare_exchange(
                state::PRESTART_WAIT,
                state::READY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
    {
        abort_sync_setup(session, my_ptr, other_ptr, false);
        return;
    }
    loop {
        let v = my.sync_var.load(Ordering::Acquire);
        if v != state::PRESTART_WAIT {
            break;
        }
        if session.abort_setup.load(Ordering::Acquire) {
            my_ptr.store(core::ptr::null_mut(), Ordering::Release);
            return;
        }
        if my.expired(host.read_tsc()) {
            if is_master {
                if my
                    .sync_var
                    .compare_exchange(
                        state::PRESTART_WAIT,
                        state::PRESTART_ABORT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    abort_sync_setup(session, my_ptr, other_ptr, true);
                    return;
                }
                // Lost the race: the worker just flipped us to READY.
                break;
            }
            abort_sync_setup(session, my_ptr, other_ptr, true);
            return;
        }
        spin_loop();
    }
    if my.sync_var.load(Ordering::Acquire) != state::READY {
        abort_sync_setup(session, my_ptr, other_ptr, false);
        return;
    }
    if !is_master
        && other
            .sync_var
            .compare_exchange(
                state::PRESTART_WAIT,
                state::READY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
    {
        abort_sync_setup(session, my_ptr, other_ptr, false);
        return;
    }

    // Cheap path first: if the counters are already in sync a zero delta
    // verifies and measurement is skipped entirely.
    match verify_delta(session, &my, other, is_master, 0) {
        VerifyOutcome::Confirmed => {
            if is_master {
                session.worker.tsc_delta.store(0, Ordering::SeqCst);
            }
        }
        VerifyOutcome::OutOfRange => {
            for attempt in 0..MEASURE_TRIES {
                let v = my.sync_var.load(Ordering::Acquire);
                if v != state::READY && (is_master || v != state::STEADY) {
                    break;
                }

                match (session.method, is_master) {
                    (DeltaMethod::ReadLatencyFilter, true) => {
                        method1::measure_master(session, &my, other)
                    }
                    (DeltaMethod::ReadLatencyFilter, false) => {
                        method1::measure_worker(session, &my, other)
                    }
                    (DeltaMethod::LockstepRings, true) => {
                        method2::measure_master(session, &my, other)
                    }
                    (DeltaMethod::LockstepRings, false) => {
                        method2::measure_worker(session, &my, other)
                    }
                }

                let v = my.sync_var.load(Ordering::Acquire);
                if v != state::READY && (is_master || v != state::STEADY) {
                    break;
                }
                if is_master && session.worker.tsc_delta.load(Ordering::SeqCst) != TSC_DELTA_UNKNOWN
                {
                    session.tries_used.store(attempt + 1, Ordering::Release);
                    break;
                }
            }
        }
        VerifyOutcome::Pending | VerifyOutcome::TimedOut => {}
    }

    // Final handshake: release the partner, unpublish, then wait to be
    // released ourselves so the stack slot stays valid until both are done.
    other.sync_var.store(state::FINAL, Ordering::Release);
    my_ptr.store(core::ptr::null_mut(), Ordering::Release);
    let mut iterations: u32 = 0;
    while my.sync_var.load(Ordering::Acquire) != state::FINAL {
        iterations = iterations.wrapping_add(1);
        if iterations % FINAL_WAIT_ONLINE_CHECK == 0 && !host.is_cpu_online(partner_cpu) {
            break;
        }
        spin_loop();
    }

    let elapsed = host.read_tsc().wrapping_sub(tsc_start);
    if is_master {
        session.elapsed_master_ticks.store(elapsed, Ordering::Relaxed);
    } else {
        session.elapsed_worker_ticks.store(elapsed, Ordering::Relaxed);
    }
}

/// Classifies an obtained delta against the confidence thresholds and
/// downgrades the page-wide rating when warranted.
fn classify_delta(page: &GipPage, config: &GipConfig, delta: i64) {
    let magnitude = delta.unsigned_abs();
    let rating = if delta == 0 {
        TscDeltaUse::ZeroClaimed
    } else if magnitude <= config.practically_zero_ticks {
        TscDeltaUse::PracticallyZero
    } else if magnitude <= config.roughly_zero_ticks {
        TscDeltaUse::RoughlyZero
    } else {
        TscDeltaUse::NotZero
    };
    page.downgrade_use_tsc_delta(rating);
}

fn ht_siblings(a: &PerCpuRecord, b: &PerCpuRecord) -> bool {
    let (a, b) = (a.apic_id(), b.apic_id());
    !a.is_nil() && !b.is_nil() && a.core() == b.core()
}

/// Measures the TSC delta of one worker CPU against the GIP master.
///
/// When master and worker are hyper-thread siblings and another suitable CPU
/// exists, that CPU substitutes as the measurement reference; siblings share
/// enough of the core that the rendezvous produces garbage candidates.
pub(crate) fn measure_delta_one(
    host: &dyn HostServices,
    page: &GipPage,
    config: &GipConfig,
    tracking: &DeltaTracking,
    master_id: CpuId,
    worker_index: usize,
) -> GipResult<()> {
    let worker = page
        .cpus
        .get(worker_index)
        .ok_or(GipError::InvalidCpuIndex(worker_index))?;
    let worker_cpu = worker.cpu_id();
    if worker_cpu.is_nil() {
        return Err(GipError::InvalidCpuIndex(worker_index));
    }
    if worker_cpu == master_id {
        return Err(GipError::InvalidParameter);
    }
    let (_, mut master) = page
        .record_for_cpu(master_id)
        .ok_or(GipError::InvalidCpuId(master_id))?;

    if ht_siblings(master, worker) && page.online_count() > 2 {
        if let Some(alt) = page.cpus.iter().find(|r| {
            let cpu = r.cpu_id();
            !cpu.is_nil()
                && cpu != worker_cpu
                && cpu != master_id
                && r.has_tsc_delta()
                && !ht_siblings(r, worker)
                && host.is_cpu_online(cpu)
        }) {
            tracing::debug!(
                worker = %worker_cpu,
                master = %master_id,
                substitute = %alt.cpu_id(),
                "substituting delta master for hyper-thread sibling"
            );
            master = alt;
        }
    }
    let master_cpu = master.cpu_id();

    if !host.is_cpu_online(master_cpu) {
        return Err(GipError::CpuOffline(master_cpu));
    }
    if !host.is_cpu_online(worker_cpu) {
        return Err(GipError::CpuOffline(worker_cpu));
    }

    let session = DeltaSession::new(
        host,
        master,
        worker,
        page.cpu_hz() / 512,
        config.delta_method,
    );
    reset_samples(&session, true);

    host.run_on_pair(master_cpu, worker_cpu, &|cpu| {
        measure_pair_callback(&session, cpu)
    })?;

    let delta = worker.tsc_delta.load(Ordering::SeqCst);
    if delta != TSC_DELTA_UNKNOWN {
        if let Some(set_index) = worker.set_index() {
            tracking.mark_measured(set_index);
        }
        classify_delta(page, config, delta);
        tracing::debug!(
            worker = %worker_cpu,
            master = %master_cpu,
            delta,
            tries = session.tries_used.load(Ordering::Relaxed),
            "tsc delta measured"
        );
        Ok(())
    } else if session.timed_out.load(Ordering::Acquire) {
        Err(GipError::MeasurementTimedOut(worker_cpu))
    } else if !host.is_cpu_online(worker_cpu) {
        Err(GipError::CpuOffline(worker_cpu))
    } else {
        Err(GipError::MeasurementFailed(worker_cpu))
    }
}

/// Measures deltas for every online CPU that lacks one, even-APIC CPUs
/// first. Core siblings carry adjacent APIC ids, so seeding one sibling of
/// each core first gives the second pass a non-sibling reference to
/// substitute in.
pub(crate) fn measure_initial_deltas(
    host: &dyn HostServices,
    page: &GipPage,
    config: &GipConfig,
    tracking: &DeltaTracking,
    master_id: CpuId,
    mp_events: &AtomicU32,
) -> GipResult<()> {
    let events_before = mp_events.load(Ordering::Acquire);
    for even_pass in [true, false] {
        for (index, record) in page.cpus.iter().enumerate() {
            let cpu = record.cpu_id();
            if cpu.is_nil() || cpu == master_id || record.has_tsc_delta() {
                continue;
            }
            if (record.apic_id().0 & 1 == 0) != even_pass {
                continue;
            }
            if !host.is_cpu_online(cpu) {
                continue;
            }
            measure_delta_one(host, page, config, tracking, master_id, index)?;
            if mp_events.load(Ordering::Acquire) != events_before {
                tracing::debug!("cpu hotplug during initial delta sweep, retrying");
                return Err(GipError::TryAgain);
            }
        }
    }
    Ok(())
}
