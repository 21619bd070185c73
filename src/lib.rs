//! Global Info Page (GIP) timekeeping core.
//!
//! Facade over the workspace crates:
//!
//! - [`gip_types`] — shared identifier and mode types with no dependencies.
//! - [`gip_host`] — the [`gip_host::HostServices`] environment abstraction
//!   and the simulated SMP host used by tests and tooling.
//! - [`gip_core`] — the page itself, TSC frequency calibration, cross-CPU
//!   TSC delta measurement and the periodic update engine.

pub use gip_core;
pub use gip_host;
pub use gip_types;

pub use gip_core::{GipConfig, GipError, GipPage, GipService, GipSession};
