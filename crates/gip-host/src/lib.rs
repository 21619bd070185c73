//! Host-services abstraction for the GIP timekeeping core.
//!
//! The GIP code never talks to the OS directly; everything it needs from the
//! environment — monotonic time, per-CPU TSC reads, cross-calls onto specific
//! CPUs, timers, CPU hotplug and power notifications — goes through the
//! [`HostServices`] trait. A real driver backs this with its kernel support
//! library; tests and tooling use [`SimHost`], a deterministic simulated SMP
//! host where every virtual CPU is a dedicated OS thread and both the
//! nanosecond clock and the TSCs are virtual.

mod services;
mod sim;

pub use services::{
    ApicIdSource, HostError, HostServices, HostTimer, IrqGuard, MpEvent, MpObserver, PowerEvent,
    PowerObserver, TimerAffinity, TimerCallback, TimerTick,
};
pub use sim::{SimHost, SimHostBuilder};
