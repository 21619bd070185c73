//! The GIP service: lifecycle, mapping and the public timekeeping API.
//!
//! One [`GipService`] owns the page, the update timer, the frequency
//! refinement and the delta bookkeeping. It is constructed against a
//! [`HostServices`] implementation (dependency injection, no globals) and
//! handed around as an `Arc`; sessions map the page through it and issue
//! measurement requests against it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bitflags::bitflags;
use gip_host::{
    HostServices, HostTimer, MpEvent, PowerEvent, TimerAffinity, TimerTick,
};
use gip_types::{
    CpuId, CpuSetIndex, CpuState, GipMode, TscDeltaUse, CPU_SET_CAPACITY, TSC_DELTA_UNKNOWN,
};

use crate::calibrate::{self, TscFreqRefiner};
use crate::config::GipConfig;
use crate::delta::{measure_delta_one, measure_initial_deltas, DeltaTracking};
use crate::error::{GipError, GipResult};
use crate::page::{GipFlags, GipPage, APIC_MAP_ENTRIES, CPU_INDEX_UNMAPPED, UPDATE_HZ_RECALC_TICKS};
use crate::topology;
use crate::update;

/// Attempts at the initial whole-system delta sweep before giving up.
const INITIAL_SWEEP_TRIES: u32 = 5;

/// Sweeps of the cross-CPU monotonicity probe used to detect per-CPU TSCs.
const DRIFT_PROBE_SWEEPS: u32 = 8;

/// First fire of the invariant-frequency refinement timer.
const REFINE_FIRST_FIRE_NS: u64 = 200_000_000;

/// Steady period of the refinement timer.
const REFINE_INTERVAL_NS: u64 = 1_000_000_000;

bitflags! {
    /// Options for an explicit delta measurement request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MeasureFlags: u32 {
        /// Re-measure even when a delta is already known.
        const FORCE = 1 << 0;
        /// Caller doesn't need the result immediately. Accepted for interface
        /// compatibility; without a dedicated measurement thread the request
        /// still runs synchronously.
        const ASYNC = 1 << 1;
    }
}

/// Per-client state. The service hands out page references only to sessions
/// that mapped, and test mode is ticketed per session so a client can neither
/// double-enable nor stop a mode it never started.
#[derive(Debug, Default)]
pub struct GipSession {
    mapped: bool,
    test_mode: bool,
}

impl GipSession {
    pub fn new() -> GipSession {
        GipSession::default()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

/// The GIP timekeeping service.
pub struct GipService {
    host: Arc<dyn HostServices>,
    config: GipConfig,
    page: Arc<GipPage>,
    /// CPU id of the current GIP master (the delta zero reference).
    master: AtomicU32,
    /// Bumped on every CPU hotplug event; sweeps use it to detect races.
    mp_event_count: AtomicU32,
    tracking: DeltaTracking,
    /// Mapped-session count; the update timer runs while it is non-zero.
    users: AtomicU32,
    /// Serializes map/unmap/flag transitions.
    lifecycle: Mutex<()>,
    /// One delta rendezvous at a time; the pair cross-calls are disruptive
    /// enough without overlapping them.
    measure_lock: Mutex<()>,
    test_mode_refs: AtomicU32,
    /// `cpu_hz` cached when a test window opens, restored when it closes.
    saved_invariant_hz: AtomicU64,
    /// Interval last pushed to the update timer; ticks follow recalibration.
    applied_interval_ns: AtomicU64,
    update_timer: OnceLock<Arc<dyn HostTimer>>,
    refine_timer: OnceLock<Arc<dyn HostTimer>>,
    refiner: OnceLock<Arc<TscFreqRefiner>>,
}

impl GipService {
    /// Builds the page, determines the TSC mode, registers the online CPUs,
    /// calibrates, elects a master and measures the initial deltas. The
    /// update timer is created stopped; the first mapping starts it.
    pub fn new(host: Arc<dyn HostServices>, config: GipConfig) -> GipResult<Arc<GipService>> {
        let possible = host.possible_cpu_count();
        if possible == 0 {
            return Err(GipError::InvalidParameter);
        }
        if possible > CPU_SET_CAPACITY
            || possible >= usize::from(CPU_INDEX_UNMAPPED)
            || possible > APIC_MAP_ENTRIES
        {
            return Err(GipError::TooManyCpus);
        }

        let mode = determine_tsc_mode(&*host);
        let page = Arc::new(GipPage::new(
            mode,
            possible,
            host.max_cpu_id(),
            config.update_hz,
        ));
        if mode == GipMode::Invariant && !host.claims_tsc_deltas_zero() {
            // The OS makes no promise; assume the BIOS got the sync close
            // and let measurements downgrade further from there.
            page.downgrade_use_tsc_delta(TscDeltaUse::PracticallyZero);
        }
        debug_assert!(
            !(page.use_tsc_delta() == TscDeltaUse::ZeroClaimed
                && mode == GipMode::AsyncTsc
                && !host.force_async_tsc())
        );
        tracing::info!(
            ?mode,
            rating = ?page.use_tsc_delta(),
            cpus = possible,
            "gip created"
        );

        let service = Arc::new(GipService {
            host,
            config,
            page,
            master: AtomicU32::new(CpuId::NIL.0),
            mp_event_count: AtomicU32::new(0),
            tracking: DeltaTracking::new(),
            users: AtomicU32::new(0),
            lifecycle: Mutex::new(()),
            measure_lock: Mutex::new(()),
            test_mode_refs: AtomicU32::new(0),
            saved_invariant_hz: AtomicU64::new(0),
            applied_interval_ns: AtomicU64::new(0),
            update_timer: OnceLock::new(),
            refine_timer: OnceLock::new(),
            refiner: OnceLock::new(),
        });
        service
            .applied_interval_ns
            .store(u64::from(service.config.update_interval_ns()), Ordering::Relaxed);

        service
            .host
            .run_on_all_online(&|cpu| service.register_current_cpu(cpu))?;

        // Invariant hosts get a quick seed and let the refinement timer
        // sharpen it; the other modes have no refiner, so they pay for the
        // precise measurement up front.
        calibrate::measure_tsc_freq(&*service.host, &service.page, mode == GipMode::Invariant)?;
        service.elect_initial_master()?;

        if service.page.use_tsc_delta() > TscDeltaUse::ZeroClaimed {
            service.measure_all_deltas()?;
        }

        let affinity = if mode == GipMode::AsyncTsc {
            TimerAffinity::AllOnline
        } else {
            TimerAffinity::Any
        };
        let weak = Arc::downgrade(&service);
        let timer = service.host.create_timer(
            u64::from(service.config.update_interval_ns()),
            affinity,
            Arc::new(move |tick| {
                if let Some(service) = weak.upgrade() {
                    service.on_update_tick(tick);
                }
            }),
        )?;
        let _ = service.update_timer.set(timer);

        if mode == GipMode::Invariant {
            service.start_freq_refinement()?;
        }

        let weak = Arc::downgrade(&service);
        service.host.set_mp_observer(Some(Arc::new(move |event, cpu| {
            if let Some(service) = weak.upgrade() {
                service.on_mp_event(event, cpu);
            }
        })));
        let weak = Arc::downgrade(&service);
        service.host.set_power_observer(Some(Arc::new(move |event| {
            if let Some(service) = weak.upgrade() {
                service.on_power_event(event);
            }
        })));

        Ok(service)
    }

    pub fn page(&self) -> &Arc<GipPage> {
        &self.page
    }

    pub fn master_cpu(&self) -> CpuId {
        CpuId(self.master.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &GipConfig {
        &self.config
    }

    /// Maps the page into a session. The first user starts the update
    /// engine; re-mapping an already mapped session is an order violation.
    pub fn map_gip(&self, session: &mut GipSession) -> GipResult<Arc<GipPage>> {
        if session.mapped {
            return Err(GipError::WrongOrder);
        }
        if !self.page.is_valid() {
            return Err(GipError::NotMapped);
        }
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if self.users.load(Ordering::SeqCst) == 0 {
            self.start_updating()?;
        }
        let users = self.users.fetch_add(1, Ordering::SeqCst) + 1;
        session.mapped = true;
        self.reap_refine_timer();
        tracing::debug!(users, "gip mapped");
        Ok(Arc::clone(&self.page))
    }

    /// Drops a session's mapping; the last one out stops the update engine.
    pub fn unmap_gip(&self, session: &mut GipSession) -> GipResult<()> {
        if !session.mapped {
            return Err(GipError::WrongOrder);
        }
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if session.test_mode {
            // The session disappears with its test-mode ticket; release it.
            self.set_flags_locked(
                session,
                GipFlags::empty(),
                GipFlags::SETTABLE.difference(GipFlags::TEST_MODE),
            )?;
        }
        session.mapped = false;
        let users = self.users.fetch_sub(1, Ordering::SeqCst) - 1;
        if users == 0 {
            if let Some(timer) = self.update_timer.get() {
                let _ = timer.stop();
            }
            tracing::debug!("last gip user gone, update timer stopped");
        }
        self.reap_refine_timer();
        Ok(())
    }

    /// Current CPU's TSC with its delta applied. An unknown delta triggers a
    /// bounded lazy measurement; this is the one path that measures on
    /// demand.
    pub fn read_adjusted_tsc(&self, session: &GipSession) -> GipResult<u64> {
        if !session.mapped {
            return Err(GipError::WrongOrder);
        }
        let page = &self.page;
        if page.use_tsc_delta() <= TscDeltaUse::ZeroClaimed {
            return Ok(self.host.read_tsc());
        }
        let mut tries = 0;
        loop {
            let (tsc, delta, cpu, index) = {
                let _irq = self.host.disable_interrupts();
                let cpu = self.host.current_cpu();
                let Some((index, record)) = page.record_for_cpu(cpu) else {
                    return Err(GipError::InvalidCpuId(cpu));
                };
                (self.host.read_tsc(), record.tsc_delta(), cpu, index)
            };
            if delta != TSC_DELTA_UNKNOWN {
                return Ok(tsc.wrapping_sub(delta as u64));
            }
            if tries >= self.config.delta_read_tsc_retries {
                return Err(GipError::MeasurementFailed(cpu));
            }
            tries += 1;
            let result = {
                let _guard = self.measure_lock.lock().unwrap_or_else(|e| e.into_inner());
                measure_delta_one(
                    &*self.host,
                    page,
                    &self.config,
                    &self.tracking,
                    self.master_cpu(),
                    index,
                )
            };
            if let Err(err) = result {
                tracing::debug!(cpu = %cpu, %err, "lazy delta measurement attempt failed");
            }
        }
    }

    /// Measures (or re-measures, with [`MeasureFlags::FORCE`]) the delta of
    /// the CPU at `set_index`, retrying failed rendezvous with a pause in
    /// between. A no-op while deltas are not in use.
    pub fn measure_delta_for_cpu(
        &self,
        session: &GipSession,
        set_index: CpuSetIndex,
        flags: MeasureFlags,
    ) -> GipResult<()> {
        if !session.mapped {
            return Err(GipError::WrongOrder);
        }
        let page = &self.page;
        if !page.is_valid() {
            return Err(GipError::NotMapped);
        }
        let index = page
            .cpu_index_from_set_index(set_index)
            .ok_or(GipError::InvalidCpuIndex(set_index))?;
        if page.use_tsc_delta() <= TscDeltaUse::ZeroClaimed {
            return Ok(());
        }
        let record = &page.cpus[index];
        let mut tries = self.config.delta_retries.clamp(1, 256);
        loop {
            if !flags.contains(MeasureFlags::FORCE) && record.has_tsc_delta() {
                return Ok(());
            }
            if record.cpu_id() == self.master_cpu() {
                // The master is the zero reference by definition.
                record.tsc_delta.store(0, Ordering::SeqCst);
                return Ok(());
            }
            let result = {
                let _guard = self.measure_lock.lock().unwrap_or_else(|e| e.into_inner());
                measure_delta_one(
                    &*self.host,
                    page,
                    &self.config,
                    &self.tracking,
                    self.master_cpu(),
                    index,
                )
            };
            match result {
                Err(GipError::MeasurementFailed(_)) if tries > 1 => {
                    tries -= 1;
                    self.host.sleep_ns(self.config.delta_retry_wait_ns);
                }
                other => return other,
            }
        }
    }

    /// ORs and ANDs the page's test-mode flags on behalf of a session.
    ///
    /// Enabling test mode is refcounted across sessions: the first enabler
    /// raises `TEST_MODE` and pulses `TEST_START`, the last leaver pulses
    /// `TEST_STOP`. A bit both set and cleared in one call is cleared.
    pub fn set_test_mode_flags(
        &self,
        session: &mut GipSession,
        or_mask: GipFlags,
        and_mask: GipFlags,
    ) -> GipResult<()> {
        if !session.mapped {
            return Err(GipError::WrongOrder);
        }
        if !self.page.is_valid() {
            return Err(GipError::NotMapped);
        }
        let or_mask = or_mask & and_mask;
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        self.set_flags_locked(session, or_mask, and_mask)
    }

    /// Stops timers, deregisters observers and tears the page's magic so
    /// stale mappings notice. Also runs on drop.
    pub fn shutdown(&self) {
        self.host.set_mp_observer(None);
        self.host.set_power_observer(None);
        if let Some(timer) = self.refine_timer.get() {
            let _ = timer.stop();
        }
        if self.page.is_valid() {
            self.page.invalidate();
            for record in self.page.cpus.iter() {
                record.tsc_delta.store(TSC_DELTA_UNKNOWN, Ordering::Relaxed);
            }
            tracing::info!("gip invalidated");
        }
        if let Some(timer) = self.update_timer.get() {
            let _ = timer.stop();
        }
    }

    /// Registers the CPU this is running on; both the boot-time sweep and
    /// the hotplug-online path land here via a cross-call.
    fn register_current_cpu(&self, cpu: CpuId) {
        let page = &self.page;
        let Some(set_index) = self.host.cpu_set_index_of(cpu) else {
            tracing::warn!(cpu = %cpu, "cpu has no set index, not registering");
            return;
        };
        let nano_ts = self.host.nano_ts();
        let tsc = self.host.read_tsc();

        page.possible_set.set(set_index);
        page.present_set.set(set_index);
        page.online_set.set(set_index);
        page.set_online_count(self.host.online_cpu_count() as u32);
        page.set_present_count(self.host.present_cpu_count() as u32);

        let Some(index) = page.find_or_alloc_record(cpu) else {
            tracing::warn!(cpu = %cpu, "no free gip record for onlined cpu");
            return;
        };
        let methods = topology::CpuLookupMethods::from_bits_truncate(page.lookup_methods());
        let Some(apic) = topology::resolve_apic_id(&*self.host, methods) else {
            tracing::warn!(cpu = %cpu, "cannot read apic id, not registering");
            return;
        };
        page.cpus[index].bring_online(
            cpu,
            set_index,
            apic,
            nano_ts,
            tsc,
            page.cpu_hz(),
            page.update_interval_ns(),
        );
        page.map_apic(apic, index);
        page.map_set_index(set_index, index);
        self.tracking.mark_unmeasured(set_index);
        tracing::debug!(cpu = %cpu, apic = apic.0, index, "cpu registered");
    }

    fn elect_initial_master(&self) -> GipResult<()> {
        let record = self
            .page
            .cpus
            .iter()
            .find(|r| r.state() == CpuState::Online && !r.cpu_id().is_nil())
            .ok_or(GipError::CpuOffline(self.host.current_cpu()))?;
        record.tsc_delta.store(0, Ordering::SeqCst);
        if let Some(set_index) = record.set_index() {
            self.tracking.mark_measured(set_index);
        }
        self.master.store(record.cpu_id().0, Ordering::SeqCst);
        tracing::debug!(master = %record.cpu_id(), "gip master elected");
        Ok(())
    }

    /// Sweeps deltas for every online CPU, retrying when a hotplug event
    /// races the sweep or a CPU disappears under it.
    fn measure_all_deltas(&self) -> GipResult<()> {
        let mut tries = INITIAL_SWEEP_TRIES;
        loop {
            let result = {
                let _guard = self.measure_lock.lock().unwrap_or_else(|e| e.into_inner());
                measure_initial_deltas(
                    &*self.host,
                    &self.page,
                    &self.config,
                    &self.tracking,
                    self.master_cpu(),
                    &self.mp_event_count,
                )
            };
            match result {
                Err(GipError::TryAgain) | Err(GipError::CpuOffline(_)) if tries > 1 => {
                    tries -= 1;
                }
                other => return other,
            }
        }
    }

    fn start_freq_refinement(self: &Arc<Self>) -> GipResult<()> {
        let refiner = Arc::new(TscFreqRefiner::anchor(&*self.host));
        let _ = self.refiner.set(Arc::clone(&refiner));
        let weak = Arc::downgrade(self);
        let timer = self.host.create_timer(
            REFINE_INTERVAL_NS,
            TimerAffinity::Any,
            Arc::new(move |_tick| {
                if let Some(service) = weak.upgrade() {
                    refiner.on_tick(
                        &*service.host,
                        &service.page,
                        &service.config,
                        service.users.load(Ordering::SeqCst),
                    );
                }
            }),
        )?;
        timer.start(REFINE_FIRST_FIRE_NS)?;
        let _ = self.refine_timer.set(timer);
        tracing::debug!("tsc frequency refinement started");
        Ok(())
    }

    /// Stops the refinement timer once the refiner says it is finished.
    /// Called from lifecycle transitions; a timer cannot stop itself from
    /// inside its own callback.
    fn reap_refine_timer(&self) {
        if let (Some(refiner), Some(timer)) = (self.refiner.get(), self.refine_timer.get()) {
            if refiner.is_done() {
                let _ = timer.stop();
            }
        }
    }

    /// First-user startup of the update engine.
    fn start_updating(&self) -> GipResult<()> {
        let page = &self.page;
        // A restarted page gets its transaction ids pushed to the recalc
        // boundary so the first ticks re-derive the real update frequency.
        if page.cpus[0].time.sequence() != 2 {
            for record in page.cpus.iter() {
                let seq = record.time.sequence();
                record
                    .time
                    .set_sequence((seq + UPDATE_HZ_RECALC_TICKS * 2) & !(UPDATE_HZ_RECALC_TICKS * 2 - 1));
            }
            page.nano_ts_last_update_hz.store(0, Ordering::SeqCst);
        }

        // Re-anchor the clock data; it has been idle since the last user
        // left. The first few intervals get ignored either way.
        if page.mode() != GipMode::AsyncTsc || self.host.online_cpu_count() == 1 {
            page.cpus[0].reinit_time(
                self.host.nano_ts(),
                self.host.read_tsc(),
                page.update_interval_ns(),
            );
        } else {
            self.host.run_on_all_online(&|cpu| {
                if let Some((_, record)) = page.record_for_cpu(cpu) {
                    record.reinit_time(
                        self.host.nano_ts(),
                        self.host.read_tsc(),
                        page.update_interval_ns(),
                    );
                }
            })?;
        }

        // Userland needs a consistent way to tell which record is its own.
        let methods = topology::detect_lookup_methods(&*self.host)?;
        page.set_lookup_methods(methods.bits());

        let timer = self.update_timer.get().ok_or(GipError::NotMapped)?;
        timer.start(0)?; // fire as soon as possible
        Ok(())
    }

    fn on_update_tick(&self, tick: TimerTick) {
        let page = &self.page;
        if !page.is_valid() {
            return;
        }
        let _irq = self.host.disable_interrupts();
        let test_forced = page.flags().contains(GipFlags::TEST_MODE);
        let nano_ts = self.host.nano_ts();
        let tsc = update::delta_adjust_timer_tsc(page, &*self.host, self.host.read_tsc());

        if page.mode() != GipMode::AsyncTsc || tick.cpu == self.master_cpu() {
            self.handle_test_mode_pulses();
            update::update_page(page, nano_ts, tsc, tick.cpu, tick.tick, test_forced);

            // The engine recalibrates its own frequency from wall-clock
            // drift; keep the host timer in step with it.
            let interval = u64::from(page.update_interval_ns());
            if interval != self.applied_interval_ns.swap(interval, Ordering::Relaxed) {
                if let Some(timer) = self.update_timer.get() {
                    timer.set_interval_ns(interval);
                    tracing::debug!(update_hz = page.update_hz(), "update timer retuned");
                }
            }
        } else {
            update::update_page_per_cpu(page, nano_ts, tsc, tick.cpu, tick.tick, test_forced);
        }
    }

    /// Consumes the test-mode start/stop pulses on the master tick path.
    fn handle_test_mode_pulses(&self) {
        let flags = self.page.flags();
        if flags.contains(GipFlags::TEST_START) {
            // Cache the calibrated rate so the stop pulse can restore it.
            self.saved_invariant_hz.store(self.page.cpu_hz(), Ordering::SeqCst);
            self.page
                .apply_flags(GipFlags::empty(), GipFlags::TEST_START.complement());
            tracing::info!("gip test window opened");
        }
        if flags.contains(GipFlags::TEST_STOP) {
            if self.page.mode() == GipMode::Invariant {
                let hz = self.saved_invariant_hz.load(Ordering::SeqCst);
                if hz != 0 {
                    self.page.propagate_cpu_hz(hz);
                }
            }
            self.page.apply_flags(
                GipFlags::empty(),
                (GipFlags::TEST_STOP | GipFlags::TEST_MODE).complement(),
            );
            tracing::info!("gip test window closed");
        }
    }

    fn set_flags_locked(
        &self,
        session: &mut GipSession,
        mut or_mask: GipFlags,
        mut and_mask: GipFlags,
    ) -> GipResult<()> {
        if or_mask.contains(GipFlags::TEST_MODE) {
            if session.test_mode {
                tracing::warn!("test mode already enabled for this session");
                return Err(GipError::WrongOrder);
            }
            session.test_mode = true;
            let refs = self.test_mode_refs.fetch_add(1, Ordering::SeqCst) + 1;
            if refs == 1 {
                or_mask |= GipFlags::TEST_MODE | GipFlags::TEST_START;
                and_mask = and_mask.difference(GipFlags::TEST_STOP);
            }
        } else if !and_mask.contains(GipFlags::TEST_MODE) && session.test_mode {
            session.test_mode = false;
            let refs = self.test_mode_refs.fetch_sub(1, Ordering::SeqCst) - 1;
            if refs == 0 {
                or_mask |= GipFlags::TEST_STOP;
            } else {
                // Other sessions still testing; keep the mode bit up.
                and_mask |= GipFlags::TEST_MODE;
            }
        }
        self.page.apply_flags(or_mask, and_mask);
        Ok(())
    }

    fn on_mp_event(&self, event: MpEvent, cpu: CpuId) {
        if !self.page.is_valid() {
            return;
        }
        self.mp_event_count.fetch_add(1, Ordering::SeqCst);
        match event {
            MpEvent::Online => self.on_cpu_online(cpu),
            MpEvent::Offline => self.on_cpu_offline(cpu),
        }
    }

    fn on_cpu_online(&self, cpu: CpuId) {
        if self
            .host
            .run_on_cpu(cpu, &|| self.register_current_cpu(cpu))
            .is_err()
        {
            tracing::warn!(cpu = %cpu, "cpu went away before gip registration");
            return;
        }
        if self.page.use_tsc_delta() > TscDeltaUse::ZeroClaimed && cpu != self.master_cpu() {
            if let Some((index, _)) = self.page.record_for_cpu(cpu) {
                let result = {
                    let _guard = self.measure_lock.lock().unwrap_or_else(|e| e.into_inner());
                    measure_delta_one(
                        &*self.host,
                        &self.page,
                        &self.config,
                        &self.tracking,
                        self.master_cpu(),
                        index,
                    )
                };
                if let Err(err) = result {
                    tracing::warn!(cpu = %cpu, %err, "delta measurement after online failed");
                }
            }
        }
    }

    fn on_cpu_offline(&self, cpu: CpuId) {
        let page = &self.page;
        if let Some((_, record)) = page.record_for_cpu(cpu) {
            if let Some(set_index) = record.set_index() {
                page.online_set.clear(set_index);
                self.tracking.forget(set_index);
            }
            page.set_online_count(self.host.online_cpu_count() as u32);
            if page.use_tsc_delta() > TscDeltaUse::ZeroClaimed {
                record.take_offline();
            } else {
                // All deltas are zero by fiat; keep them.
                record.set_state(CpuState::Offline);
            }
            tracing::debug!(cpu = %cpu, "cpu offlined");
        }
        let master = self.master_cpu();
        if cpu == master {
            self.failover_master(master);
        }
    }

    /// The master went offline: promote the first remaining online CPU to
    /// the delta zero reference.
    fn failover_master(&self, old: CpuId) {
        let successor = self.page.cpus.iter().find(|r| {
            let id = r.cpu_id();
            !id.is_nil() && id != old && r.state() == CpuState::Online
        });
        if let Some(record) = successor {
            let new_cpu = record.cpu_id();
            if self
                .master
                .compare_exchange(old.0, new_cpu.0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                record.tsc_delta.store(0, Ordering::SeqCst);
                if let Some(set_index) = record.set_index() {
                    self.tracking.mark_measured(set_index);
                }
                tracing::info!(old = %old, new = %new_cpu, "gip master switched");
            }
        } else {
            tracing::warn!(old = %old, "gip master offlined with no online successor");
        }
    }

    fn on_power_event(&self, event: PowerEvent) {
        tracing::info!(?event, "power event");
        if let Some(refiner) = self.refiner.get() {
            refiner.note_power_event();
        }
        if event == PowerEvent::Resume && self.page.use_tsc_delta() > TscDeltaUse::ZeroClaimed {
            // Firmware may reset or rescale the counters across a suspend;
            // nothing measured before it can be trusted.
            let master = self.master_cpu();
            for record in self.page.cpus.iter() {
                if record.state() == CpuState::Online && record.cpu_id() != master {
                    record.tsc_delta.store(TSC_DELTA_UNKNOWN, Ordering::SeqCst);
                    if let Some(set_index) = record.set_index() {
                        self.tracking.mark_unmeasured(set_index);
                    }
                }
            }
            if let Err(err) = self.measure_all_deltas() {
                tracing::warn!(%err, "delta re-measurement after resume failed");
            }
        }
    }
}

impl Drop for GipService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn determine_tsc_mode(host: &dyn HostServices) -> GipMode {
    // One CPU has nothing to be out of sync with.
    if host.online_cpu_count() <= 1 {
        return if host.has_invariant_tsc() {
            GipMode::Invariant
        } else {
            GipMode::SyncTsc
        };
    }
    if host.force_async_tsc() {
        tracing::info!("async tsc mode forced by host");
        return GipMode::AsyncTsc;
    }
    if host.has_invariant_tsc() {
        return GipMode::Invariant;
    }
    if probe_async_drift(host) {
        tracing::info!("tsc drift observed across cpus, falling back to async mode");
        return GipMode::AsyncTsc;
    }
    GipMode::SyncTsc
}

/// Hops across every online CPU reading the TSC; a reading that fails to
/// advance past the previous CPU's means the counters are per-CPU.
fn probe_async_drift(host: &dyn HostServices) -> bool {
    use std::sync::atomic::AtomicBool;

    let drift = AtomicBool::new(false);
    let prev = AtomicU64::new(0);
    for _ in 0..DRIFT_PROBE_SWEEPS {
        for index in 0..host.possible_cpu_count() {
            let Some(cpu) = host.cpu_at_set_index(index) else {
                continue;
            };
            if !host.is_cpu_online(cpu) {
                continue;
            }
            let _ = host.run_on_cpu(cpu, &|| {
                let tsc = host.read_tsc();
                if tsc <= prev.swap(tsc, Ordering::SeqCst) {
                    drift.store(true, Ordering::SeqCst);
                }
            });
            if drift.load(Ordering::SeqCst) {
                return true;
            }
        }
    }
    false
}
