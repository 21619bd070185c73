//! Deterministic simulated SMP host.
//!
//! Every virtual CPU is a dedicated OS thread draining a job mailbox, so
//! cross-calls really do run concurrently on distinct threads and the
//! rendezvous code in the delta synchronizer is exercised for real. Time is
//! virtual:
//!
//! - The nanosecond clock is a global counter advanced by sleeps and spin
//!   waits (plus one tick per read so busy loops observe progress). Tests
//!   never wait in wall-clock time.
//! - A TSC read is `clock_ns * ticks_per_ns + seq + offset`, where `seq` is a
//!   globally ordered per-read counter and `offset` is the per-CPU injected
//!   skew. The global ordering makes cross-CPU measurements converge on the
//!   injected offset to within a handful of ticks, which is what the delta
//!   algorithms are designed to dig out of a real machine.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gip_types::{ApicId, CpuId, CpuSet, CpuSetIndex};

use crate::services::{
    ApicIdSource, HostError, HostServices, HostTimer, MpEvent, MpObserver, PowerEvent,
    PowerObserver, TimerAffinity, TimerCallback, TimerTick,
};

/// Virtual-clock cost charged for dispatching a cross-call.
const CROSS_CALL_COST_NS: u64 = 500;

/// Real-time pause used to keep virtual-time timer threads from starving the
/// thread(s) a test is asserting from.
const TIMER_REAL_PAUSE: Duration = Duration::from_micros(50);

thread_local! {
    static CURRENT_CPU: Cell<Option<u32>> = const { Cell::new(None) };
}

type Job = Box<dyn FnOnce() + Send>;

const APIC_UNSUPPORTED: u32 = u32::MAX;

struct SimCpu {
    /// APIC ID per [`ApicIdSource`], `APIC_UNSUPPORTED` when the source is
    /// disabled for this CPU.
    apic: [AtomicU32; 3],
    tsc_offset: AtomicI64,
    online: AtomicBool,
    mailbox: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`SimHost`].
pub struct SimHostBuilder {
    cpus: usize,
    ticks_per_ns: u64,
    invariant_tsc: bool,
    force_async: bool,
}

impl SimHostBuilder {
    pub fn cpus(mut self, cpus: usize) -> Self {
        assert!(cpus >= 1);
        self.cpus = cpus;
        self
    }

    /// Simulated TSC rate; the default of 4 models a 4 GHz part.
    pub fn ticks_per_ns(mut self, ticks: u64) -> Self {
        assert!(ticks >= 1);
        self.ticks_per_ns = ticks;
        self
    }

    pub fn invariant_tsc(mut self, invariant: bool) -> Self {
        self.invariant_tsc = invariant;
        self
    }

    pub fn force_async_tsc(mut self, force: bool) -> Self {
        self.force_async = force;
        self
    }

    pub fn build(self) -> Arc<SimHost> {
        let host = Arc::new_cyclic(|weak| SimHost {
            self_weak: weak.clone(),
            cpus: (0..self.cpus)
                .map(|i| SimCpu {
                    apic: [
                        AtomicU32::new(i as u32),
                        AtomicU32::new(i as u32),
                        AtomicU32::new(i as u32),
                    ],
                    tsc_offset: AtomicI64::new(0),
                    online: AtomicBool::new(true),
                    mailbox: Mutex::new(None),
                    worker: Mutex::new(None),
                })
                .collect(),
            clock_ns: AtomicU64::new(1),
            tsc_seq: AtomicU64::new(0),
            ticks_per_ns: self.ticks_per_ns,
            invariant_tsc: AtomicBool::new(self.invariant_tsc),
            force_async: AtomicBool::new(self.force_async),
            mp_observer: Mutex::new(None),
            power_observer: Mutex::new(None),
        });
        for index in 0..host.cpus.len() {
            host.spawn_worker(index);
        }
        host
    }
}

/// Simulated SMP host. See the module docs for the time model.
pub struct SimHost {
    self_weak: Weak<SimHost>,
    cpus: Vec<SimCpu>,
    clock_ns: AtomicU64,
    tsc_seq: AtomicU64,
    ticks_per_ns: u64,
    invariant_tsc: AtomicBool,
    force_async: AtomicBool,
    mp_observer: Mutex<Option<MpObserver>>,
    power_observer: Mutex<Option<PowerObserver>>,
}

impl SimHost {
    pub fn builder() -> SimHostBuilder {
        SimHostBuilder { cpus: 1, ticks_per_ns: 4, invariant_tsc: true, force_async: false }
    }

    /// Invariant-TSC host with `cpus` online CPUs and zero TSC skew.
    pub fn new(cpus: usize) -> Arc<SimHost> {
        SimHost::builder().cpus(cpus).build()
    }

    pub fn ticks_per_ns(&self) -> u64 {
        self.ticks_per_ns
    }

    /// Nominal simulated TSC frequency in Hz (the clock runs at 1 GHz).
    pub fn nominal_tsc_hz(&self) -> u64 {
        self.ticks_per_ns * 1_000_000_000
    }

    /// Injects a fixed TSC skew for `cpu`, in ticks.
    pub fn set_tsc_offset(&self, cpu: CpuId, offset_ticks: i64) {
        self.cpu(cpu).tsc_offset.store(offset_ticks, Ordering::Relaxed);
    }

    pub fn tsc_offset(&self, cpu: CpuId) -> i64 {
        self.cpu(cpu).tsc_offset.load(Ordering::Relaxed)
    }

    /// Sets the APIC ID reported by every source on `cpu`.
    pub fn set_apic_id(&self, cpu: CpuId, apic: ApicId) {
        for slot in &self.cpu(cpu).apic {
            slot.store(apic.0, Ordering::Relaxed);
        }
    }

    /// Sets the APIC ID reported by one source only, to model a CPU where the
    /// lookup paths disagree.
    pub fn set_apic_id_for_source(&self, cpu: CpuId, source: ApicIdSource, apic: ApicId) {
        self.cpu(cpu).apic[source_index(source)].store(apic.0, Ordering::Relaxed);
    }

    /// Marks one lookup source unsupported on `cpu`.
    pub fn disable_apic_source(&self, cpu: CpuId, source: ApicIdSource) {
        self.cpu(cpu).apic[source_index(source)].store(APIC_UNSUPPORTED, Ordering::Relaxed);
    }

    pub fn set_invariant_tsc(&self, invariant: bool) {
        self.invariant_tsc.store(invariant, Ordering::Relaxed);
    }

    /// Brings a CPU online and notifies the MP observer.
    pub fn set_cpu_online(&self, cpu: CpuId) {
        if !self.cpu(cpu).online.swap(true, Ordering::SeqCst) {
            tracing::debug!(cpu = cpu.0, "sim: cpu online");
            self.notify_mp(MpEvent::Online, cpu);
        }
    }

    /// Takes a CPU offline and notifies the MP observer.
    pub fn set_cpu_offline(&self, cpu: CpuId) {
        if self.cpu(cpu).online.swap(false, Ordering::SeqCst) {
            tracing::debug!(cpu = cpu.0, "sim: cpu offline");
            self.notify_mp(MpEvent::Offline, cpu);
        }
    }

    /// Delivers a suspend notification.
    pub fn suspend(&self) {
        self.notify_power(PowerEvent::Suspend);
    }

    /// Delivers a resume notification, optionally with fresh TSC skews (a
    /// suspend/resume cycle may reset or rescale the counters).
    pub fn resume(&self) {
        self.notify_power(PowerEvent::Resume);
    }

    /// Advances the virtual clock without blocking anyone.
    pub fn advance_ns(&self, ns: u64) {
        self.clock_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Runs `f` with the calling thread masquerading as `cpu`, as if the
    /// scheduler had placed the caller there. Test helper.
    pub fn with_current_cpu<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        assert!((cpu.0 as usize) < self.cpus.len());
        let prev = CURRENT_CPU.with(|c| c.replace(Some(cpu.0)));
        let result = f();
        CURRENT_CPU.with(|c| c.set(prev));
        result
    }

    fn cpu(&self, cpu: CpuId) -> &SimCpu {
        &self.cpus[cpu.0 as usize]
    }

    fn checked_cpu(&self, cpu: CpuId) -> Result<&SimCpu, HostError> {
        self.cpus.get(cpu.0 as usize).ok_or(HostError::CpuNotFound(cpu))
    }

    fn spawn_worker(&self, index: usize) {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("sim-cpu{index}"))
            .spawn(move || {
                CURRENT_CPU.with(|c| c.set(Some(index as u32)));
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn sim cpu thread: {e}"));
        *self.cpus[index].mailbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.cpus[index].worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Ships a borrowed closure to a CPU worker and waits for completion.
    fn dispatch_and_wait(&self, cpu: CpuId, f: &(dyn Fn() + Sync)) -> Result<(), HostError> {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        // SAFETY: the borrow is erased to 'static so it can cross the channel,
        // but we block on `done_rx` (or the sender being dropped) before
        // returning, so the closure cannot outlive the frame that owns it.
        let f_static: &'static (dyn Fn() + Sync) = unsafe { std::mem::transmute(f) };
        let job: Job = Box::new(move || {
            f_static();
            let _ = done_tx.send(());
        });
        let sender = {
            let guard = self.cpu(cpu).mailbox.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match sender {
            Some(tx) if tx.send(job).is_ok() => {
                done_rx.recv().map_err(|_| HostError::CpuOffline(cpu))
            }
            _ => Err(HostError::CpuOffline(cpu)),
        }
    }

    fn dispatch_nowait(&self, cpu: CpuId, f: &(dyn Fn() + Sync)) -> Result<Receiver<()>, HostError> {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        // SAFETY: as in dispatch_and_wait; the caller waits on the returned
        // receiver before the borrow can go away.
        let f_static: &'static (dyn Fn() + Sync) = unsafe { std::mem::transmute(f) };
        let job: Job = Box::new(move || {
            f_static();
            let _ = done_tx.send(());
        });
        let sender = {
            let guard = self.cpu(cpu).mailbox.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match sender {
            Some(tx) if tx.send(job).is_ok() => Ok(done_rx),
            _ => Err(HostError::CpuOffline(cpu)),
        }
    }

    fn notify_mp(&self, event: MpEvent, cpu: CpuId) {
        let observer = self.mp_observer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(observer) = observer {
            observer(event, cpu);
        }
    }

    fn notify_power(&self, event: PowerEvent) {
        let observer = self.power_observer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(observer) = observer {
            observer(event);
        }
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        for cpu in &self.cpus {
            cpu.mailbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
        for cpu in &self.cpus {
            if let Some(handle) = cpu.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = handle.join();
            }
        }
    }
}

fn source_index(source: ApicIdSource) -> usize {
    match source {
        ApicIdSource::ExtLeaf0B => 0,
        ApicIdSource::ExtLeaf8000001E => 1,
        ApicIdSource::Legacy => 2,
    }
}

impl HostServices for SimHost {
    fn nano_ts(&self) -> u64 {
        // Advance by one per read so pure busy-waiters observe progress.
        self.clock_ns.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read_tsc(&self) -> u64 {
        let ns = self.clock_ns.load(Ordering::Relaxed);
        let seq = self.tsc_seq.fetch_add(1, Ordering::SeqCst);
        let base = ns * self.ticks_per_ns + seq;
        let offset = self.cpu(self.current_cpu()).tsc_offset.load(Ordering::Relaxed);
        base.wrapping_add(offset as u64)
    }

    fn current_cpu(&self) -> CpuId {
        CpuId(CURRENT_CPU.with(|c| c.get()).unwrap_or(0))
    }

    fn apic_id_via(&self, source: ApicIdSource) -> Option<ApicId> {
        let raw = self.cpu(self.current_cpu()).apic[source_index(source)].load(Ordering::Relaxed);
        (raw != APIC_UNSUPPORTED).then_some(ApicId(raw))
    }

    fn has_invariant_tsc(&self) -> bool {
        self.invariant_tsc.load(Ordering::Relaxed)
    }

    fn force_async_tsc(&self) -> bool {
        self.force_async.load(Ordering::Relaxed)
    }

    fn max_cpu_id(&self) -> CpuId {
        CpuId(self.cpus.len() as u32 - 1)
    }

    fn possible_cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn online_cpu_count(&self) -> usize {
        self.cpus.iter().filter(|c| c.online.load(Ordering::SeqCst)).count()
    }

    fn present_cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn cpu_set_index_of(&self, cpu: CpuId) -> Option<CpuSetIndex> {
        ((cpu.0 as usize) < self.cpus.len()).then_some(cpu.0 as usize)
    }

    fn cpu_at_set_index(&self, index: CpuSetIndex) -> Option<CpuId> {
        (index < self.cpus.len()).then_some(CpuId(index as u32))
    }

    fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.checked_cpu(cpu).map_or(false, |c| c.online.load(Ordering::SeqCst))
    }

    fn is_cpu_present(&self, cpu: CpuId) -> bool {
        (cpu.0 as usize) < self.cpus.len()
    }

    fn online_cpu_set(&self) -> CpuSet {
        let set = CpuSet::new();
        for (i, cpu) in self.cpus.iter().enumerate() {
            if cpu.online.load(Ordering::SeqCst) {
                set.set(i);
            }
        }
        set
    }

    fn present_cpu_set(&self) -> CpuSet {
        self.possible_cpu_set()
    }

    fn possible_cpu_set(&self) -> CpuSet {
        let set = CpuSet::new();
        for i in 0..self.cpus.len() {
            set.set(i);
        }
        set
    }

    fn run_on_cpu(&self, cpu: CpuId, f: &(dyn Fn() + Sync)) -> Result<(), HostError> {
        let state = self.checked_cpu(cpu)?;
        if !state.online.load(Ordering::SeqCst) {
            return Err(HostError::CpuOffline(cpu));
        }
        if self.current_cpu() == cpu && CURRENT_CPU.with(|c| c.get()).is_some() {
            f();
            return Ok(());
        }
        self.advance_ns(CROSS_CALL_COST_NS);
        self.dispatch_and_wait(cpu, f)
    }

    fn run_on_pair(&self, a: CpuId, b: CpuId, f: &(dyn Fn(CpuId) + Sync)) -> Result<(), HostError> {
        assert_ne!(a, b, "run_on_pair requires two distinct cpus");
        for cpu in [a, b] {
            let state = self.checked_cpu(cpu)?;
            if !state.online.load(Ordering::SeqCst) {
                return Err(HostError::CpuOffline(cpu));
            }
        }
        self.advance_ns(CROSS_CALL_COST_NS);
        let fa = move || f(a);
        let fb = move || f(b);
        let rx_a = self.dispatch_nowait(a, &fa)?;
        let rx_b = match self.dispatch_nowait(b, &fb) {
            Ok(rx) => rx,
            Err(e) => {
                // One side stranded; wait for it so the borrows stay valid.
                let _ = rx_a.recv();
                return Err(e);
            }
        };
        let ra = rx_a.recv();
        let rb = rx_b.recv();
        ra.map_err(|_| HostError::CpuOffline(a))?;
        rb.map_err(|_| HostError::CpuOffline(b))?;
        Ok(())
    }

    fn run_on_all_online(&self, f: &(dyn Fn(CpuId) + Sync)) -> Result<(), HostError> {
        self.advance_ns(CROSS_CALL_COST_NS);
        let me = CURRENT_CPU.with(|c| c.get());
        let mut local = None;
        let mut remote = Vec::new();
        for i in 0..self.cpus.len() {
            let cpu = CpuId(i as u32);
            if !self.cpus[i].online.load(Ordering::SeqCst) {
                continue;
            }
            if me == Some(cpu.0) {
                local = Some(cpu);
            } else {
                remote.push(cpu);
            }
        }
        // Every dispatched closure must outlive its receiver, so box them all
        // up front instead of borrowing a per-iteration stack slot.
        let jobs: Vec<Box<dyn Fn() + Sync>> = remote
            .iter()
            .map(|&cpu| Box::new(move || f(cpu)) as Box<dyn Fn() + Sync>)
            .collect();
        let mut waits = Vec::new();
        for (&cpu, job) in remote.iter().zip(&jobs) {
            if let Ok(rx) = self.dispatch_nowait(cpu, job.as_ref()) {
                waits.push(rx);
            }
        }
        if let Some(cpu) = local {
            f(cpu);
        }
        for rx in waits {
            let _ = rx.recv();
        }
        Ok(())
    }

    fn sleep_ns(&self, ns: u64) {
        self.clock_ns.fetch_add(ns, Ordering::Relaxed);
        if ns >= 1_000_000 {
            thread::sleep(TIMER_REAL_PAUSE);
        } else {
            thread::yield_now();
        }
    }

    fn spin_wait_ns(&self, ns: u64) {
        self.clock_ns.fetch_add(ns, Ordering::Relaxed);
        std::hint::spin_loop();
    }

    fn create_timer(
        &self,
        interval_ns: u64,
        affinity: TimerAffinity,
        callback: TimerCallback,
    ) -> Result<Arc<dyn HostTimer>, HostError> {
        if let TimerAffinity::Specific(cpu) = affinity {
            self.checked_cpu(cpu)?;
        }
        // Timers hold a weak host reference so a leaked (never-stopped) timer
        // can't keep the host alive.
        Ok(Arc::new(SimTimer {
            host: self.self_weak.clone(),
            interval_ns: Arc::new(AtomicU64::new(interval_ns)),
            affinity,
            callback,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }))
    }

    fn set_mp_observer(&self, observer: Option<MpObserver>) {
        *self.mp_observer.lock().unwrap_or_else(|e| e.into_inner()) = observer;
    }

    fn set_power_observer(&self, observer: Option<PowerObserver>) {
        *self.power_observer.lock().unwrap_or_else(|e| e.into_inner()) = observer;
    }
}

struct SimTimer {
    host: Weak<SimHost>,
    interval_ns: Arc<AtomicU64>,
    affinity: TimerAffinity,
    callback: TimerCallback,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostTimer for SimTimer {
    fn start(&self, first_interval_ns: u64) -> Result<(), HostError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HostError::TimerActive);
        }
        let host = self.host.clone();
        let running = Arc::clone(&self.running);
        let callback = Arc::clone(&self.callback);
        let affinity = self.affinity;
        let interval = Arc::clone(&self.interval_ns);
        let handle = thread::Builder::new()
            .name("sim-timer".into())
            .spawn(move || {
                let mut tick: u64 = 0;
                let mut wait = first_interval_ns;
                loop {
                    let Some(host) = host.upgrade() else { break };
                    host.sleep_ns(wait);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tick += 1;
                    fire(&*host, affinity, &callback, tick);
                    wait = interval.load(Ordering::SeqCst);
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn sim timer thread: {e}"));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), HostError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(HostError::TimerNotActive);
        }
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn set_interval_ns(&self, interval_ns: u64) {
        self.interval_ns.store(interval_ns, Ordering::SeqCst);
    }
}

fn fire(host: &SimHost, affinity: TimerAffinity, callback: &TimerCallback, tick: u64) {
    match affinity {
        TimerAffinity::Any => callback(TimerTick { tick, cpu: host.current_cpu() }),
        TimerAffinity::Specific(cpu) => {
            let cb = || callback(TimerTick { tick, cpu });
            let _ = host.run_on_cpu(cpu, &cb);
        }
        TimerAffinity::AllOnline => {
            let cb = |cpu: CpuId| callback(TimerTick { tick, cpu });
            let _ = host.run_on_all_online(&cb);
        }
    }
}
