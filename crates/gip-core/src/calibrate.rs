//! TSC frequency calibration.
//!
//! A rough measurement over a short interval seeds the page at creation so
//! delta measurement has a usable tick budget; a second, longer measurement
//! follows once deltas are in. On invariant hosts a low-duty timer then
//! keeps refining the frequency against an anchor sample taken at startup,
//! where every extra second of baseline sharpens the estimate, until the
//! refinement window closes or a consumer maps the page and deserves a value
//! that stops moving.

use core::sync::atomic::{AtomicBool, Ordering};

use gip_host::HostServices;
use gip_types::{CpuId, GipMode, TscDeltaUse, TSC_DELTA_UNKNOWN};

use crate::config::GipConfig;
use crate::error::{GipError, GipResult};
use crate::page::GipPage;

const NS_PER_SEC: u64 = 1_000_000_000;
const NS_PER_MS: u64 = 1_000_000;

/// Reads the TSC/wall-clock pair plus the CPU it was taken on, without
/// interruptions between the reads.
pub(crate) fn read_tsc_and_nano_ts(host: &dyn HostServices) -> (u64, u64, CpuId) {
    let guard = host.disable_interrupts();
    let tsc = host.read_tsc();
    let nano_ts = host.nano_ts();
    let cpu = host.current_cpu();
    drop(guard);
    (tsc, nano_ts, cpu)
}

fn compute_hz(elapsed_tsc: u64, elapsed_ns: u64) -> u64 {
    (u128::from(elapsed_tsc) * u128::from(NS_PER_SEC) / u128::from(elapsed_ns.max(1))) as u64
}

/// Publishes a measured frequency. Only the page-level atomic is written
/// here; the record copy goes through the tick engine (or, at creation,
/// through propagation while no timers exist yet), so the update timer
/// stays the sole seqlock writer.
fn set_cpu_freq(page: &GipPage, elapsed_ns: u64, elapsed_tsc: u64) {
    page.set_cpu_hz(compute_hz(elapsed_tsc, elapsed_ns));
}

/// Measures the TSC frequency over a sampling interval.
///
/// `rough` trades accuracy for speed, which is all the delta measurement
/// bootstrap needs; the precise pass samples over a longer interval. Either
/// way the thread may migrate mid-measurement, and what that costs depends
/// on the mode: synchronized TSCs don't care, async mode must retry on the
/// original CPU, and the rough pass settles for a cross-call read.
pub(crate) fn measure_tsc_freq(
    host: &dyn HostServices,
    page: &GipPage,
    rough: bool,
) -> GipResult<()> {
    let mut tries_left: u32 = if rough { 4 } else { 2 };
    while tries_left > 0 {
        tries_left -= 1;

        let (mut tsc_start, ns_start, cpu_start) = read_tsc_and_nano_ts(host);

        if page.mode() == GipMode::Invariant {
            // Rate is constant, so sleeping is fine and easier on the host.
            let target_ns = if rough { 16 } else { 200 } * NS_PER_MS;
            loop {
                let elapsed = host.nano_ts().saturating_sub(ns_start);
                if elapsed >= target_ns {
                    break;
                }
                host.sleep_ns(target_ns - elapsed);
            }
        } else {
            // Busy-wait to keep power management from clocking us down
            // mid-measurement.
            host.spin_wait_ns(100 * NS_PER_MS);
        }

        let (mut tsc_stop, mut ns_stop, cpu_stop) = read_tsc_and_nano_ts(host);

        if cpu_stop != cpu_start {
            let mut do_cross_read = false;
            match page.mode() {
                // Unlikely to have migrated for TSC-related reasons; the
                // readings remain comparable.
                GipMode::SyncTsc => {}
                GipMode::Invariant if rough => do_cross_read = true,
                GipMode::Invariant => {
                    if page.use_tsc_delta() > TscDeltaUse::ZeroClaimed {
                        let start_delta = page
                            .record_for_cpu(cpu_start)
                            .map_or(TSC_DELTA_UNKNOWN, |(_, r)| r.tsc_delta());
                        let stop_delta = page
                            .record_for_cpu(cpu_stop)
                            .map_or(TSC_DELTA_UNKNOWN, |(_, r)| r.tsc_delta());
                        if start_delta != TSC_DELTA_UNKNOWN && stop_delta != TSC_DELTA_UNKNOWN {
                            if page.use_tsc_delta() > TscDeltaUse::PracticallyZero {
                                tsc_start = tsc_start.wrapping_sub(start_delta as u64);
                                tsc_stop = tsc_stop.wrapping_sub(stop_delta as u64);
                            }
                        } else if tries_left > 0 {
                            continue;
                        } else {
                            do_cross_read = true;
                        }
                    }
                }
                GipMode::AsyncTsc => {
                    // The whole point of async mode is that the counters are
                    // not comparable; only a reading from the start CPU will
                    // do.
                    if tries_left > 0 {
                        continue;
                    }
                    do_cross_read = true;
                }
            }
            if do_cross_read {
                let res = cross_read(host, cpu_start);
                match res {
                    Ok((tsc, ns)) => {
                        tsc_stop = tsc;
                        ns_stop = ns;
                    }
                    Err(_) if !rough || tries_left > 0 => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        set_cpu_freq(page, ns_stop - ns_start, tsc_stop.wrapping_sub(tsc_start));
        if page.mode() != GipMode::AsyncTsc {
            // Creation-time call, no timers running yet.
            page.propagate_cpu_hz(page.cpu_hz());
        }
        tracing::debug!(
            cpu_hz = page.cpu_hz(),
            rough,
            "tsc frequency measured"
        );
        return Ok(());
    }

    debug_assert!(!rough);
    Err(GipError::FreqMeasurementFailed)
}

fn cross_read(
    host: &dyn HostServices,
    cpu: CpuId,
) -> Result<(u64, u64), gip_host::HostError> {
    use core::sync::atomic::AtomicU64;
    let tsc = AtomicU64::new(0);
    let ns = AtomicU64::new(0);
    host.run_on_cpu(cpu, &|| {
        let (t, n, _) = read_tsc_and_nano_ts(host);
        tsc.store(t, Ordering::Release);
        ns.store(n, Ordering::Release);
    })?;
    Ok((tsc.load(Ordering::Acquire), ns.load(Ordering::Acquire)))
}

/// Anchor point and lifecycle flags for invariant-mode frequency refinement.
///
/// The owning service drives this from a timer; the refiner itself only
/// flags completion because a timer cannot stop itself from inside its own
/// callback.
pub(crate) struct TscFreqRefiner {
    start_tsc: u64,
    start_ns: u64,
    start_cpu: CpuId,
    power_event: AtomicBool,
    done: AtomicBool,
}

impl TscFreqRefiner {
    /// Takes the anchor sample on the current CPU.
    pub(crate) fn anchor(host: &dyn HostServices) -> TscFreqRefiner {
        let (start_tsc, start_ns, start_cpu) = read_tsc_and_nano_ts(host);
        TscFreqRefiner {
            start_tsc,
            start_ns,
            start_cpu,
            power_event: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// A suspend or resume makes the anchor worthless; stop refining.
    pub(crate) fn note_power_event(&self) {
        self.power_event.store(true, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.power_event.load(Ordering::Acquire)
    }

    /// One refinement tick. Recomputes the frequency over the whole baseline
    /// since the anchor and stops once the window closes, a power event
    /// intervened, or mapped consumers need the value frozen.
    pub(crate) fn on_tick(
        &self,
        host: &dyn HostServices,
        page: &GipPage,
        config: &GipConfig,
        gip_users: u32,
    ) {
        if self.is_done() {
            return;
        }
        debug_assert_eq!(page.mode(), GipMode::Invariant);

        let (tsc, ns, cpu) = read_tsc_and_nano_ts(host);
        let elapsed_ns = ns.saturating_sub(self.start_ns);
        let mut elapsed_tsc = tsc.wrapping_sub(self.start_tsc);

        // A different CPU than the anchor's means both deltas must be folded
        // in, and they may not have been measured yet. Give the measurements
        // five refinement windows to show up before giving up.
        if cpu != self.start_cpu && page.use_tsc_delta() > TscDeltaUse::ZeroClaimed {
            let start_delta = page
                .record_for_cpu(self.start_cpu)
                .map_or(TSC_DELTA_UNKNOWN, |(_, r)| r.tsc_delta());
            let stop_delta = page
                .record_for_cpu(cpu)
                .map_or(TSC_DELTA_UNKNOWN, |(_, r)| r.tsc_delta());
            if start_delta != TSC_DELTA_UNKNOWN && stop_delta != TSC_DELTA_UNKNOWN {
                if page.use_tsc_delta() > TscDeltaUse::PracticallyZero {
                    elapsed_tsc = elapsed_tsc.wrapping_add(start_delta.wrapping_sub(stop_delta) as u64);
                }
            } else if elapsed_ns > u64::from(config.refine_window_secs) * 5 * NS_PER_SEC {
                tracing::warn!(
                    elapsed_secs = elapsed_ns / NS_PER_SEC,
                    "giving up on tsc frequency refinement, deltas unavailable"
                );
                self.done.store(true, Ordering::Release);
                return;
            } else {
                return;
            }
        }

        if gip_users == 0 || elapsed_ns < u64::from(config.refine_freeze_after_secs) * NS_PER_SEC {
            set_cpu_freq(page, elapsed_ns, elapsed_tsc);
            if elapsed_ns > u64::from(config.refine_window_secs) * NS_PER_SEC {
                tracing::debug!(cpu_hz = page.cpu_hz(), "tsc frequency refinement finished");
                self.done.store(true, Ordering::Release);
            }
        } else {
            self.done.store(true, Ordering::Release);
        }
    }
}
