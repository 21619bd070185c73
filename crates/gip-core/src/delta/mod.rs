//! Cross-CPU TSC delta measurement.
//!
//! Two CPUs rendezvous through a pair of cache-line-isolated sync slots,
//! enter a lockstep handshake with interrupts disabled, and then run one of
//! two sampling algorithms to estimate the constant offset between their
//! counters. The master CPU is the reference: a worker's delta is the value
//! to subtract from its raw TSC to land on the master's timeline.
//!
//! There is no way to read two TSCs at the same instant, so both algorithms
//! are statistical: they collect many candidate deltas and keep the one
//! closest to the master reference, relying on the rendezvous to squeeze the
//! window down to a few ticks.

mod measure;
mod method1;
mod method2;
mod sync;
mod verify;

pub use measure::DeltaTracking;
pub(crate) use measure::{measure_delta_one, measure_initial_deltas};

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use gip_host::HostServices;
use gip_types::CpuId;

use crate::page::PerCpuRecord;

/// Which sampling algorithm the synchronizer runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaMethod {
    /// Master publishes samples; worker filters by observed read latency.
    ReadLatencyFilter,
    /// Both sides fill sequence-tagged sample rings and the master
    /// cross-references them. The default.
    LockstepRings,
}

/// True when `candidate` is a better delta estimate than `best`: smallest
/// non-negative wins, otherwise the negative closest to zero.
#[inline]
pub(crate) fn better_delta_candidate(best: i64, candidate: i64) -> bool {
    if candidate >= 0 {
        candidate < best
    } else {
        candidate > best || best == gip_types::TSC_DELTA_UNKNOWN
    }
}

/// Rendezvous sync states. The prestart pair handles discovery before the
/// two sides have each other's slots; the rest drive the measurement loops.
pub(crate) mod state {
    pub const PRESTART_WAIT: u32 = 0x0ffe;
    pub const PRESTART_ABORT: u32 = 0x0fff;
    pub const READY: u32 = 0x1000;
    pub const STEADY: u32 = 0x1001;
    pub const GO: u32 = 0x1002;
    pub const GO_GO: u32 = 0x1003;
    pub const TIMEOUT: u32 = 0x1ffe;
    pub const FINAL: u32 = 0x1fff;
}

/// Sync sequence value meaning "gave up on lockstep convergence".
pub(crate) const SYNC_SEQ_GAVE_UP: u32 = u32::MAX;

/// Method 1 loop counts.
pub(crate) const M1_LOOPS: u32 = 96;
pub(crate) const M1_PRIMER_LOOPS: u32 = 4;
pub(crate) const M1_READ_TIME_LOOPS: u32 = 24;

/// Method 2 ring geometry and loop count.
pub(crate) const M2_ENTRIES: usize = 64;
pub(crate) const M2_LOOPS: u32 = 7;

/// Ping-pong samples per side in the verification pass. Must stay even.
pub(crate) const VERIFY_SAMPLES: usize = 32;

/// Attempts the measurement loop makes inside one rendezvous.
pub(crate) const MEASURE_TRIES: u32 = 12;

/// Per-side rendezvous sync slot. Stack-resident in the pair callback and
/// published by pointer; isolated to its own cache line because the partner
/// CPU writes it continuously.
#[repr(align(128))]
pub(crate) struct SyncSlot {
    pub sync_var: AtomicU32,
    pub sync_seq: AtomicU32,
    /// TSC at publication, start of this side's timeout budget.
    pub tsc_start: AtomicU64,
    pub max_ticks: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<SyncSlot>() % 128 == 0);

impl SyncSlot {
    pub(crate) fn new() -> SyncSlot {
        SyncSlot {
            sync_var: AtomicU32::new(state::PRESTART_WAIT),
            sync_seq: AtomicU32::new(0),
            tsc_start: AtomicU64::new(0),
            max_ticks: AtomicU64::new(0),
        }
    }

    pub(crate) fn expired(&self, now_tsc: u64) -> bool {
        now_tsc.wrapping_sub(self.tsc_start.load(Ordering::Relaxed))
            > self.max_ticks.load(Ordering::Relaxed)
    }
}

/// One method-2 ring entry: own sequence, the other side's sequence as
/// observed, and the TSC read between the two own-sequence increments.
#[derive(Debug)]
pub(crate) struct M2Entry {
    pub seq_mine: AtomicU32,
    pub seq_other: AtomicU32,
    pub tsc: AtomicU64,
}

impl M2Entry {
    fn new() -> M2Entry {
        M2Entry {
            seq_mine: AtomicU32::new(0),
            seq_other: AtomicU32::new(0),
            tsc: AtomicU64::new(0),
        }
    }
}

/// Per-side scratch data, cache-line aligned so the sides never false-share.
#[repr(align(128))]
pub(crate) struct SideData {
    /// Method-2 live sequence; incremented twice per collected entry so an
    /// odd observation pinpoints the in-flight entry.
    pub m2_seq: AtomicU32,
    /// Whether this side inserts pauses this round (lag scheduling).
    pub m2_lag: AtomicBool,
    pub m2_entries: [M2Entry; M2_ENTRIES],
    pub verify_tscs: [AtomicU64; VERIFY_SAMPLES],
}

const _: () = assert!(core::mem::size_of::<SideData>() % 128 == 0);

impl SideData {
    fn new() -> SideData {
        SideData {
            m2_seq: AtomicU32::new(0),
            m2_lag: AtomicBool::new(false),
            m2_entries: core::array::from_fn(|_| M2Entry::new()),
            verify_tscs: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// Outcome of the verification pass, shared master-to-worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VerifyOutcome {
    /// Not run / still running.
    Pending = 0,
    /// The assumed delta holds: merged samples are monotone.
    Confirmed = 1,
    /// Ordering violated; a full measurement is needed.
    OutOfRange = 2,
    /// The rendezvous fell apart; retry the whole thing.
    TimedOut = 3,
}

impl VerifyOutcome {
    fn from_raw(raw: u32) -> VerifyOutcome {
        match raw {
            1 => VerifyOutcome::Confirmed,
            2 => VerifyOutcome::OutOfRange,
            3 => VerifyOutcome::TimedOut,
            _ => VerifyOutcome::Pending,
        }
    }
}

/// Shared state of one master/worker measurement.
pub(crate) struct DeltaSession<'a> {
    pub host: &'a dyn HostServices,
    pub master: &'a PerCpuRecord,
    pub worker: &'a PerCpuRecord,
    pub master_cpu: CpuId,
    pub worker_cpu: CpuId,
    /// Per-side spin budget, in TSC ticks.
    pub max_tsc_ticks: u64,
    pub method: DeltaMethod,

    /// Sync slot pointers, published by each side once its stack slot is
    /// ready and nulled again before the slot goes out of scope.
    pub sync_master: AtomicPtr<SyncSlot>,
    pub sync_worker: AtomicPtr<SyncSlot>,
    pub abort_setup: AtomicBool,
    pub timed_out: AtomicBool,

    pub verify_outcome: AtomicU32,
    pub master_side: SideData,
    pub worker_side: SideData,

    /// Attempts the measurement loop used, recorded by the master.
    pub tries_used: AtomicU32,
    pub elapsed_master_ticks: AtomicU64,
    pub elapsed_worker_ticks: AtomicU64,
}

impl<'a> DeltaSession<'a> {
    pub(crate) fn new(
        host: &'a dyn HostServices,
        master: &'a PerCpuRecord,
        worker: &'a PerCpuRecord,
        max_tsc_ticks: u64,
        method: DeltaMethod,
    ) -> DeltaSession<'a> {
        DeltaSession {
            host,
            master,
            worker,
            master_cpu: master.cpu_id(),
            worker_cpu: worker.cpu_id(),
            max_tsc_ticks,
            method,
            sync_master: AtomicPtr::new(core::ptr::null_mut()),
            sync_worker: AtomicPtr::new(core::ptr::null_mut()),
            abort_setup: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            verify_outcome: AtomicU32::new(VerifyOutcome::Pending as u32),
            master_side: SideData::new(),
            worker_side: SideData::new(),
            tries_used: AtomicU32::new(0),
            elapsed_master_ticks: AtomicU64::new(0),
            elapsed_worker_ticks: AtomicU64::new(0),
        }
    }

    pub(crate) fn verify_outcome(&self) -> VerifyOutcome {
        VerifyOutcome::from_raw(self.verify_outcome.load(Ordering::Acquire))
    }

    pub(crate) fn set_verify_outcome(&self, outcome: VerifyOutcome) {
        self.verify_outcome.store(outcome as u32, Ordering::Release);
    }
}
