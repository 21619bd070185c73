use crate::delta::DeltaMethod;

/// Tunables for the GIP service, injected at construction.
#[derive(Clone, Debug)]
pub struct GipConfig {
    /// |delta| at or below this many ticks rates as practically zero.
    pub practically_zero_ticks: u64,
    /// |delta| at or below this many ticks rates as roughly zero.
    pub roughly_zero_ticks: u64,
    /// Which measurement algorithm the synchronizer runs.
    pub delta_method: DeltaMethod,
    /// Attempts per explicit delta measurement request.
    pub delta_retries: u32,
    /// Wait between measurement attempts, nanoseconds.
    pub delta_retry_wait_ns: u64,
    /// Attempts for the lazy measurement on the adjusted-TSC read path.
    pub delta_read_tsc_retries: u32,
    /// Nominal update frequency of the tick engine, Hz.
    pub update_hz: u32,
    /// Seconds the invariant-frequency refinement keeps improving the value.
    pub refine_window_secs: u32,
    /// Stop touching the frequency once the page has users and this many
    /// seconds of refinement have passed; mapped consumers may have baked the
    /// value into their own conversion factors.
    pub refine_freeze_after_secs: u32,
}

impl Default for GipConfig {
    fn default() -> Self {
        GipConfig {
            practically_zero_ticks: 32,
            roughly_zero_ticks: 448,
            delta_method: DeltaMethod::LockstepRings,
            delta_retries: 12,
            delta_retry_wait_ns: 2_000_000,
            delta_read_tsc_retries: 4,
            update_hz: 1000,
            refine_window_secs: 12,
            refine_freeze_after_secs: 2,
        }
    }
}

impl GipConfig {
    /// Update interval in nanoseconds for the configured frequency.
    pub fn update_interval_ns(&self) -> u32 {
        1_000_000_000 / self.update_hz.max(1)
    }
}
