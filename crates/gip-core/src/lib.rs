//! The Global Information Page (GIP) timekeeping core.
//!
//! A GIP is one shared, lock-free-readable page of timekeeping data for an
//! SMP system: per-CPU TSC timestamps and frequencies behind seqlocks, the
//! system TSC mode (invariant, synchronized or per-CPU async), and the
//! measured per-CPU TSC deltas that make raw TSC reads comparable across
//! CPUs. [`GipService`] owns the page and drives it: topology tracking, TSC
//! mode determination, pairwise delta measurement over a cross-CPU
//! rendezvous, frequency calibration and refinement, and a periodic update
//! engine started while mapped consumers exist.
//!
//! The host environment is abstracted behind `gip_host::HostServices`; tests
//! run the whole stack against the simulated SMP host.

mod calibrate;
mod config;
mod delta;
mod error;
mod page;
mod seqlock;
mod service;
mod topology;
mod update;

pub use config::GipConfig;
pub use delta::{DeltaMethod, DeltaTracking};
pub use error::{GipError, GipResult};
pub use page::{
    CpuTick, GipFlags, GipPage, PerCpuRecord, APIC_MAP_ENTRIES, GIP_MAGIC, GIP_VERSION,
};
pub use seqlock::{SeqLock, WriteGuard};
pub use service::{GipService, GipSession, MeasureFlags};
pub use topology::CpuLookupMethods;
