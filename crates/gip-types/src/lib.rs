//! Shared identifier and set types for the GIP timekeeping crates.
//!
//! These are deliberately dependency-free: both the host abstraction and the
//! GIP core speak in terms of `CpuId` / `ApicId` / `CpuSet`, so they live in a
//! leaf crate underneath both.

mod cpuset;
mod ids;
mod mode;

pub use cpuset::{CpuSet, CPU_SET_CAPACITY};
pub use ids::{ApicId, CpuId, CpuSetIndex};
pub use mode::{CpuState, GipMode, TscDeltaUse};

/// Nominal page size used to express the GIP's size in whole pages.
pub const PAGE_SIZE: usize = 4096;

/// Placeholder CPU frequency used until calibration has produced a real
/// value: one tick below 4 GHz, distinctive enough to spot in logs.
pub const PLACEHOLDER_CPU_HZ: u64 = 4_000_000_000 - 1;

/// Sentinel meaning "TSC delta not yet measured" in a per-CPU record.
pub const TSC_DELTA_UNKNOWN: i64 = i64::MAX;

/// Sentinel value a TSC sample slot holds while no sample is published.
/// Real TSC reads that collide with it are nudged down by one tick.
pub const TSC_SAMPLE_RESERVED: u64 = u64::MAX;
