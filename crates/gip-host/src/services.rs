use std::cell::Cell;
use std::sync::Arc;

use gip_types::{ApicId, CpuId, CpuSet, CpuSetIndex};

/// Errors surfaced by the host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("cpu {0} is offline")]
    CpuOffline(CpuId),
    #[error("cpu {0} does not exist")]
    CpuNotFound(CpuId),
    #[error("timer is already running")]
    TimerActive,
    #[error("timer is not running")]
    TimerNotActive,
}

/// Ways the current CPU's APIC ID can be obtained.
///
/// Models the CPUID-based lookup paths: extended topology leaf 0x0B, the AMD
/// extended leaf 0x8000001E, and the legacy 8-bit APIC ID byte from leaf 1.
/// A host may support any subset; the topology tracker probes each source on
/// every online CPU and only trusts the ones that check out everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApicIdSource {
    ExtLeaf0B,
    ExtLeaf8000001E,
    Legacy,
}

impl ApicIdSource {
    pub const ALL: [ApicIdSource; 3] = [
        ApicIdSource::ExtLeaf0B,
        ApicIdSource::ExtLeaf8000001E,
        ApicIdSource::Legacy,
    ];
}

/// CPU hotplug events delivered to the registered MP observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpEvent {
    Online,
    Offline,
}

/// Power transition events delivered to the registered power observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerEvent {
    Suspend,
    Resume,
}

/// Where a periodic timer's callback runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAffinity {
    /// Whatever CPU the host finds convenient.
    Any,
    /// Always on the given CPU.
    Specific(CpuId),
    /// On every online CPU, once per tick each.
    AllOnline,
}

/// One timer expiry.
#[derive(Clone, Copy, Debug)]
pub struct TimerTick {
    /// Tick ordinal, starting at 1 for the first fire after `start`.
    pub tick: u64,
    /// CPU the callback is running on.
    pub cpu: CpuId,
}

pub type TimerCallback = Arc<dyn Fn(TimerTick) + Send + Sync>;
pub type MpObserver = Arc<dyn Fn(MpEvent, CpuId) + Send + Sync>;
pub type PowerObserver = Arc<dyn Fn(PowerEvent) + Send + Sync>;

/// Handle to a periodic host timer. Created stopped.
pub trait HostTimer: Send + Sync {
    /// Starts the timer; the first fire comes after `first_interval_ns`,
    /// subsequent fires at the configured interval.
    fn start(&self, first_interval_ns: u64) -> Result<(), HostError>;

    /// Stops the timer and waits for any in-flight callback to finish.
    fn stop(&self) -> Result<(), HostError>;

    /// Changes the steady-state interval; takes effect from the next fire.
    fn set_interval_ns(&self, interval_ns: u64);
}

thread_local! {
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII token standing in for a disabled-interrupts critical section.
///
/// The delta-measurement rendezvous must not be interrupted between the
/// handshake and the TSC reads; code that requires this takes an `IrqGuard`
/// by value so the contract is visible in the signature. In the simulated
/// host this only tracks nesting depth per thread.
#[derive(Debug)]
pub struct IrqGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl IrqGuard {
    pub(crate) fn acquire() -> Self {
        IRQ_DEPTH.with(|d| d.set(d.get() + 1));
        IrqGuard { _not_send: std::marker::PhantomData }
    }

    /// Whether the calling thread currently holds at least one guard.
    pub fn held_on_this_thread() -> bool {
        IRQ_DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        IRQ_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Everything the GIP core needs from its host environment.
///
/// Methods that say "current CPU" are meaningful from any context; on the
/// simulated host the current CPU is the virtual CPU whose worker thread is
/// executing, or the boot CPU for foreign threads.
pub trait HostServices: Send + Sync {
    /// Monotonic system time in nanoseconds. Strictly increasing per call.
    fn nano_ts(&self) -> u64;

    /// Reads the current CPU's time stamp counter.
    fn read_tsc(&self) -> u64;

    fn current_cpu(&self) -> CpuId;

    /// The current CPU's APIC ID via the given source, `None` if the source
    /// is unsupported on this host.
    fn apic_id_via(&self, source: ApicIdSource) -> Option<ApicId>;

    /// Whether the CPU advertises an invariant (constant-rate) TSC.
    fn has_invariant_tsc(&self) -> bool;

    /// Host/OS override forcing async timekeeping regardless of probing.
    fn force_async_tsc(&self) -> bool {
        false
    }

    /// Whether the OS guarantees the TSCs are already synchronized across
    /// CPUs, making per-CPU delta measurement pointless.
    fn claims_tsc_deltas_zero(&self) -> bool {
        false
    }

    fn max_cpu_id(&self) -> CpuId;
    fn possible_cpu_count(&self) -> usize;
    fn online_cpu_count(&self) -> usize;
    fn present_cpu_count(&self) -> usize;

    fn cpu_set_index_of(&self, cpu: CpuId) -> Option<CpuSetIndex>;
    fn cpu_at_set_index(&self, index: CpuSetIndex) -> Option<CpuId>;
    fn is_cpu_online(&self, cpu: CpuId) -> bool;
    fn is_cpu_present(&self, cpu: CpuId) -> bool;

    /// Snapshots of the host CPU sets.
    fn online_cpu_set(&self) -> CpuSet;
    fn present_cpu_set(&self) -> CpuSet;
    fn possible_cpu_set(&self) -> CpuSet;

    /// Runs `f` on the given CPU, blocking until it returns.
    fn run_on_cpu(&self, cpu: CpuId, f: &(dyn Fn() + Sync)) -> Result<(), HostError>;

    /// Runs `f` concurrently on both CPUs (passed their own id), blocking
    /// until both invocations return. The two CPUs must differ.
    fn run_on_pair(&self, a: CpuId, b: CpuId, f: &(dyn Fn(CpuId) + Sync)) -> Result<(), HostError>;

    /// Runs `f` on every online CPU, blocking until all are done.
    fn run_on_all_online(&self, f: &(dyn Fn(CpuId) + Sync)) -> Result<(), HostError>;

    /// Blocks the caller for at least `ns`; the thread may be descheduled.
    fn sleep_ns(&self, ns: u64);

    /// Burns at least `ns` without yielding the CPU.
    fn spin_wait_ns(&self, ns: u64);

    fn disable_interrupts(&self) -> IrqGuard {
        IrqGuard::acquire()
    }

    /// Creates a stopped periodic timer.
    fn create_timer(
        &self,
        interval_ns: u64,
        affinity: TimerAffinity,
        callback: TimerCallback,
    ) -> Result<Arc<dyn HostTimer>, HostError>;

    /// Installs (or clears) the single MP-event observer.
    fn set_mp_observer(&self, observer: Option<MpObserver>);

    /// Installs (or clears) the single power-event observer.
    fn set_power_observer(&self, observer: Option<PowerObserver>);
}
