//! The Global Information Page and its per-CPU records.
//!
//! The page is the shared read surface: consumers hold a reference through a
//! mapping handle and read lock-free while the service updates it. Per-CPU
//! clock data sits behind a [`SeqLock`]; everything else is plain atomics.
//! The CPU table and the two index maps are sized once, at construction, from
//! the host's possible-CPU count.

use core::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use gip_types::{
    ApicId, CpuId, CpuSet, CpuSetIndex, CpuState, GipMode, TscDeltaUse, PAGE_SIZE,
    PLACEHOLDER_CPU_HZ, TSC_DELTA_UNKNOWN, TSC_SAMPLE_RESERVED,
};

use crate::seqlock::SeqLock;

/// Magic the mapping API validates ("GIP" + format 1).
pub const GIP_MAGIC: u32 = u32::from_le_bytes(*b"GIP\x01");

/// Page format version.
pub const GIP_VERSION: u32 = 0x0001_0000;

/// Entries in the APIC-ID-to-CPU-index map.
pub const APIC_MAP_ENTRIES: usize = 1024;

/// The tick engine re-derives the update frequency every this many ticks.
pub const UPDATE_HZ_RECALC_TICKS: u32 = 0x800;

/// Map entry value meaning "no CPU here".
pub const CPU_INDEX_UNMAPPED: u16 = u16::MAX;

bitflags! {
    /// Runtime GIP flags, test-mode plumbing for TSC benchmarking tools.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GipFlags: u32 {
        /// Test mode is active; the update engine leaves `cpu_hz` alone.
        const TEST_MODE = 1 << 0;
        /// Pulse: a measurement window is starting.
        const TEST_START = 1 << 1;
        /// Pulse: the measurement window is over.
        const TEST_STOP = 1 << 2;
    }
}

impl GipFlags {
    /// Bits a session may set through the flags API.
    pub const SETTABLE: GipFlags =
        GipFlags::TEST_MODE.union(GipFlags::TEST_START).union(GipFlags::TEST_STOP);
}

/// Seqlock-protected clock snapshot of one CPU.
#[derive(Clone, Copy, Debug)]
pub struct CpuTick {
    /// Monotonic system time of the last update.
    pub nano_ts: u64,
    /// TSC at `nano_ts`, delta-adjusted where applicable.
    pub tsc: u64,
    /// This CPU's TSC frequency.
    pub cpu_hz: u64,
    /// Average TSC ticks between updates, plus slack.
    pub update_interval_tsc: u32,
    /// Nanoseconds between the last two updates.
    pub prev_update_interval_ns: u32,
    /// Recent TSC intervals; `history_head` indexes the newest entry.
    pub tsc_history: [u32; 8],
    pub tsc_history_head: u32,
}

impl CpuTick {
    fn seed(cpu_hz: u64, update_interval_ns: u32) -> CpuTick {
        let interval_guess = interval_ticks(cpu_hz, update_interval_ns);
        CpuTick {
            nano_ts: 0,
            tsc: 0,
            cpu_hz,
            update_interval_tsc: interval_guess,
            prev_update_interval_ns: update_interval_ns,
            tsc_history: [interval_guess; 8],
            tsc_history_head: 0,
        }
    }
}

fn interval_ticks(cpu_hz: u64, update_interval_ns: u32) -> u32 {
    ((cpu_hz.saturating_mul(update_interval_ns as u64)) / 1_000_000_000).min(u32::MAX as u64) as u32
}

/// Per-CPU GIP record. Padded out to a cache-line multiple so records never
/// share a line; the delta rendezvous hammers `tsc_sample` from two CPUs.
#[repr(align(128))]
pub struct PerCpuRecord {
    /// Clock data; the seqlock sequence is the record's transaction id.
    pub time: SeqLock<CpuTick>,
    /// Offset to subtract from this CPU's raw TSC; `TSC_DELTA_UNKNOWN` until
    /// measured.
    pub tsc_delta: AtomicI64,
    /// Scratch slot for the delta rendezvous; `TSC_SAMPLE_RESERVED` when idle.
    pub tsc_sample: AtomicU64,
    /// Update anomalies observed on this CPU (interrupted transactions,
    /// impossible TSC intervals).
    pub error_count: AtomicU32,
    state: AtomicU32,
    cpu_id: AtomicU32,
    apic_id: AtomicU32,
    set_index: AtomicI64,
}

const _: () = assert!(core::mem::size_of::<PerCpuRecord>() % 128 == 0);
const _: () = assert!(core::mem::align_of::<PerCpuRecord>() == 128);

impl PerCpuRecord {
    fn unused(cpu_hz: u64, update_interval_ns: u32) -> PerCpuRecord {
        PerCpuRecord {
            time: SeqLock::new(CpuTick::seed(cpu_hz, update_interval_ns)),
            tsc_delta: AtomicI64::new(TSC_DELTA_UNKNOWN),
            tsc_sample: AtomicU64::new(TSC_SAMPLE_RESERVED),
            error_count: AtomicU32::new(0),
            state: AtomicU32::new(CpuState::Invalid as u32),
            cpu_id: AtomicU32::new(CpuId::NIL.0),
            apic_id: AtomicU32::new(ApicId::NIL.0),
            set_index: AtomicI64::new(-1),
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_raw(self.state.load(Ordering::Acquire)).unwrap_or(CpuState::Invalid)
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn cpu_id(&self) -> CpuId {
        CpuId(self.cpu_id.load(Ordering::Acquire))
    }

    pub fn apic_id(&self) -> ApicId {
        ApicId(self.apic_id.load(Ordering::Acquire))
    }

    pub fn set_index(&self) -> Option<CpuSetIndex> {
        let raw = self.set_index.load(Ordering::Acquire);
        (raw >= 0).then_some(raw as CpuSetIndex)
    }

    pub fn tsc_delta(&self) -> i64 {
        self.tsc_delta.load(Ordering::Acquire)
    }

    pub fn has_tsc_delta(&self) -> bool {
        self.tsc_delta() != TSC_DELTA_UNKNOWN
    }

    /// Claims an unused slot for `cpu`. Returns false if the slot is taken by
    /// a different CPU.
    pub(crate) fn claim(&self, cpu: CpuId) -> bool {
        self.cpu_id
            .compare_exchange(CpuId::NIL.0, cpu.0, Ordering::AcqRel, Ordering::Acquire)
            .map_or_else(|current| current == cpu.0, |_| true)
    }

    /// Fills in identity and clock seed when the CPU comes online.
    pub(crate) fn bring_online(
        &self,
        cpu: CpuId,
        set_index: CpuSetIndex,
        apic: ApicId,
        nano_ts: u64,
        tsc: u64,
        cpu_hz: u64,
        update_interval_ns: u32,
    ) {
        self.cpu_id.store(cpu.0, Ordering::Release);
        self.set_index.store(set_index as i64, Ordering::Release);
        self.apic_id.store(apic.0, Ordering::Release);
        self.tsc_delta.store(TSC_DELTA_UNKNOWN, Ordering::Release);
        self.tsc_sample.store(TSC_SAMPLE_RESERVED, Ordering::Release);
        {
            let mut tick = self.time.begin_write();
            let interval_guess = interval_ticks(cpu_hz, update_interval_ns);
            tick.cpu_hz = cpu_hz;
            tick.update_interval_tsc = interval_guess;
            tick.tsc_history = [interval_guess; 8];
            tick.tsc_history_head = 0;
            tick.prev_update_interval_ns = update_interval_ns;
            // Backdate one interval so the first tick computes a sane delta.
            tick.nano_ts = nano_ts.saturating_sub(update_interval_ns as u64);
            tick.tsc = tsc.saturating_sub(interval_guess as u64);
        }
        self.set_state(CpuState::Online);
    }

    /// Re-anchors the clock data without touching identity, used when the
    /// update timer restarts after an idle period.
    pub(crate) fn reinit_time(&self, nano_ts: u64, tsc: u64, update_interval_ns: u32) {
        let mut tick = self.time.begin_write();
        let interval_guess = interval_ticks(tick.cpu_hz, update_interval_ns);
        tick.nano_ts = nano_ts.saturating_sub(update_interval_ns as u64);
        tick.tsc = tsc.saturating_sub(interval_guess as u64);
    }

    pub(crate) fn take_offline(&self) {
        self.set_state(CpuState::Offline);
        self.tsc_delta.store(TSC_DELTA_UNKNOWN, Ordering::Release);
        self.tsc_sample.store(TSC_SAMPLE_RESERVED, Ordering::Release);
    }
}

/// The Global Information Page.
pub struct GipPage {
    magic: AtomicU32,
    pub version: u32,
    mode: GipMode,
    /// Entries in `cpus`.
    pub cpu_count: usize,
    /// Size of the page structure in whole pages.
    pub page_count: usize,
    update_hz: AtomicU32,
    update_interval_ns: AtomicU32,
    pub nano_ts_last_update_hz: AtomicU64,
    cpu_hz: AtomicU64,
    online_count: AtomicU32,
    present_count: AtomicU32,
    pub possible_count: usize,
    pub max_cpu_id: CpuId,
    use_tsc_delta: AtomicU32,
    lookup_methods: AtomicU32,
    flags: AtomicU32,
    pub online_set: CpuSet,
    pub present_set: CpuSet,
    pub possible_set: CpuSet,
    cpu_from_apic_id: Box<[AtomicU16]>,
    cpu_from_set_index: Box<[AtomicU16]>,
    pub cpus: Box<[PerCpuRecord]>,
}

impl GipPage {
    pub(crate) fn new(mode: GipMode, possible_count: usize, max_cpu_id: CpuId, update_hz: u32) -> GipPage {
        let update_interval_ns = 1_000_000_000 / update_hz.max(1);
        let cpus: Box<[PerCpuRecord]> = (0..possible_count)
            .map(|_| PerCpuRecord::unused(PLACEHOLDER_CPU_HZ, update_interval_ns))
            .collect();
        let byte_size = core::mem::size_of::<GipPage>()
            + possible_count * core::mem::size_of::<PerCpuRecord>()
            + (APIC_MAP_ENTRIES + possible_count) * core::mem::size_of::<u16>();
        // Deltas only matter when the TSC is supposed to be one system-wide
        // counter; the sync/async modes never consult them. Invariant hosts
        // start at ZeroClaimed and the service downgrades from there.
        let initial_delta_use = match mode {
            GipMode::Invariant => TscDeltaUse::ZeroClaimed,
            GipMode::SyncTsc | GipMode::AsyncTsc => TscDeltaUse::NotApplicable,
        };
        GipPage {
            magic: AtomicU32::new(GIP_MAGIC),
            version: GIP_VERSION,
            mode,
            cpu_count: possible_count,
            page_count: byte_size.div_ceil(PAGE_SIZE),
            update_hz: AtomicU32::new(update_hz),
            update_interval_ns: AtomicU32::new(update_interval_ns),
            nano_ts_last_update_hz: AtomicU64::new(0),
            cpu_hz: AtomicU64::new(PLACEHOLDER_CPU_HZ),
            online_count: AtomicU32::new(0),
            present_count: AtomicU32::new(0),
            possible_count,
            max_cpu_id,
            use_tsc_delta: AtomicU32::new(initial_delta_use as u32),
            lookup_methods: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            online_set: CpuSet::new(),
            present_set: CpuSet::new(),
            possible_set: CpuSet::new(),
            cpu_from_apic_id: (0..APIC_MAP_ENTRIES)
                .map(|_| AtomicU16::new(CPU_INDEX_UNMAPPED))
                .collect(),
            cpu_from_set_index: (0..possible_count)
                .map(|_| AtomicU16::new(CPU_INDEX_UNMAPPED))
                .collect(),
            cpus,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == GIP_MAGIC
    }

    /// Tears the magic so stale mappings can notice the page died.
    pub(crate) fn invalidate(&self) {
        self.magic.store(!GIP_MAGIC, Ordering::Release);
    }

    pub fn mode(&self) -> GipMode {
        self.mode
    }

    pub fn cpu_hz(&self) -> u64 {
        self.cpu_hz.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu_hz(&self, hz: u64) {
        self.cpu_hz.store(hz, Ordering::Release);
    }

    pub fn update_hz(&self) -> u32 {
        self.update_hz.load(Ordering::Acquire)
    }

    pub fn update_interval_ns(&self) -> u32 {
        self.update_interval_ns.load(Ordering::Acquire)
    }

    /// Stores an update frequency measured from wall-clock drift, keeping
    /// the interval as measured rather than recomputing it from the rate.
    pub(crate) fn set_update_hz_measured(&self, hz: u32, interval_ns: u32) {
        self.update_hz.store(hz, Ordering::Release);
        self.update_interval_ns.store(interval_ns, Ordering::Release);
    }

    pub fn online_count(&self) -> u32 {
        self.online_count.load(Ordering::Acquire)
    }

    pub fn present_count(&self) -> u32 {
        self.present_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_online_count(&self, count: u32) {
        self.online_count.store(count, Ordering::Release);
    }

    pub(crate) fn set_present_count(&self, count: u32) {
        self.present_count.store(count, Ordering::Release);
    }

    pub fn use_tsc_delta(&self) -> TscDeltaUse {
        TscDeltaUse::from_raw(self.use_tsc_delta.load(Ordering::Acquire))
            .unwrap_or(TscDeltaUse::NotZero)
    }

    /// Lowers the delta confidence to `rating` if it is currently better.
    /// Ratings never improve once evidence of skew exists.
    pub(crate) fn downgrade_use_tsc_delta(&self, rating: TscDeltaUse) {
        let mut current = self.use_tsc_delta.load(Ordering::Acquire);
        while current < rating as u32 {
            match self.use_tsc_delta.compare_exchange_weak(
                current,
                rating as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    /// Whether this mode wants per-CPU deltas measured at all.
    pub fn deltas_applicable(&self) -> bool {
        self.use_tsc_delta() != TscDeltaUse::NotApplicable
    }

    pub fn flags(&self) -> GipFlags {
        GipFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn apply_flags(&self, or_mask: GipFlags, and_mask: GipFlags) -> GipFlags {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            let next = (current & and_mask.bits()) | or_mask.bits();
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return GipFlags::from_bits_truncate(next),
                Err(now) => current = now,
            }
        }
    }

    pub fn lookup_methods(&self) -> u32 {
        self.lookup_methods.load(Ordering::Acquire)
    }

    pub(crate) fn set_lookup_methods(&self, methods: u32) {
        self.lookup_methods.store(methods, Ordering::Release);
    }

    /// Record index for an APIC ID, if mapped.
    pub fn cpu_index_from_apic(&self, apic: ApicId) -> Option<usize> {
        let entry = self.cpu_from_apic_id.get(apic.0 as usize)?;
        let index = entry.load(Ordering::Acquire);
        (index != CPU_INDEX_UNMAPPED).then_some(index as usize)
    }

    /// Record index for a CPU set index, if mapped.
    pub fn cpu_index_from_set_index(&self, set_index: CpuSetIndex) -> Option<usize> {
        let entry = self.cpu_from_set_index.get(set_index)?;
        let index = entry.load(Ordering::Acquire);
        (index != CPU_INDEX_UNMAPPED).then_some(index as usize)
    }

    pub(crate) fn map_apic(&self, apic: ApicId, record_index: usize) {
        if let Some(entry) = self.cpu_from_apic_id.get(apic.0 as usize) {
            entry.store(record_index as u16, Ordering::Release);
        }
    }

    pub(crate) fn map_set_index(&self, set_index: CpuSetIndex, record_index: usize) {
        if let Some(entry) = self.cpu_from_set_index.get(set_index) {
            entry.store(record_index as u16, Ordering::Release);
        }
    }

    /// The record for a CPU id, scanning the bounded table.
    pub fn record_for_cpu(&self, cpu: CpuId) -> Option<(usize, &PerCpuRecord)> {
        self.cpus
            .iter()
            .enumerate()
            .find(|(_, r)| r.cpu_id() == cpu && r.state() != CpuState::Invalid)
    }

    /// Finds the slot already owned by `cpu`, or claims a fresh one.
    pub(crate) fn find_or_alloc_record(&self, cpu: CpuId) -> Option<usize> {
        if let Some((index, _)) = self.record_for_cpu(cpu) {
            return Some(index);
        }
        for (index, record) in self.cpus.iter().enumerate() {
            if record.state() == CpuState::Invalid && record.claim(cpu) {
                return Some(index);
            }
        }
        None
    }

    /// Copies the system `cpu_hz` into every record; sync modes keep the
    /// per-CPU values identical by definition.
    pub(crate) fn propagate_cpu_hz(&self, hz: u64) {
        self.set_cpu_hz(hz);
        for record in self.cpus.iter() {
            let mut tick = record.time.begin_write();
            tick.cpu_hz = hz;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_is_a_cache_line_multiple() {
        assert_eq!(core::mem::size_of::<PerCpuRecord>() % 128, 0);
    }

    #[test]
    fn claim_is_idempotent_per_cpu_and_exclusive_across_cpus() {
        let record = PerCpuRecord::unused(PLACEHOLDER_CPU_HZ, 1_000_000);
        assert!(record.claim(CpuId(3)));
        assert!(record.claim(CpuId(3)));
        assert!(!record.claim(CpuId(4)));
    }

    #[test]
    fn delta_use_only_downgrades() {
        let page = GipPage::new(GipMode::Invariant, 2, CpuId(1), 1000);
        assert_eq!(page.use_tsc_delta(), TscDeltaUse::ZeroClaimed);
        page.downgrade_use_tsc_delta(TscDeltaUse::RoughlyZero);
        assert_eq!(page.use_tsc_delta(), TscDeltaUse::RoughlyZero);
        page.downgrade_use_tsc_delta(TscDeltaUse::PracticallyZero);
        assert_eq!(page.use_tsc_delta(), TscDeltaUse::RoughlyZero);
        page.downgrade_use_tsc_delta(TscDeltaUse::NotZero);
        assert_eq!(page.use_tsc_delta(), TscDeltaUse::NotZero);
    }

    #[test]
    fn async_mode_marks_deltas_not_applicable() {
        let page = GipPage::new(GipMode::AsyncTsc, 2, CpuId(1), 1000);
        assert!(!page.deltas_applicable());
    }

    #[test]
    fn index_maps_round_trip() {
        let page = GipPage::new(GipMode::Invariant, 4, CpuId(3), 1000);
        page.map_apic(ApicId(7), 2);
        page.map_set_index(1, 2);
        assert_eq!(page.cpu_index_from_apic(ApicId(7)), Some(2));
        assert_eq!(page.cpu_index_from_set_index(1), Some(2));
        assert_eq!(page.cpu_index_from_apic(ApicId(8)), None);
        assert_eq!(page.cpu_index_from_set_index(0), None);
    }

    #[test]
    fn invalidate_tears_the_magic() {
        let page = GipPage::new(GipMode::SyncTsc, 1, CpuId(0), 1000);
        assert!(page.is_valid());
        page.invalidate();
        assert!(!page.is_valid());
    }
}
