//! Per-tick page update engine.
//!
//! Every timer tick refreshes one per-CPU record under its seqlock: new
//! timestamps, the TSC interval history and, when the frequency is not
//! known to be invariant, a freshly smoothed CPU frequency. In the sync
//! modes record 0 carries the whole system; in async mode each CPU's tick
//! refreshes that CPU's own record.

use core::sync::atomic::Ordering;

use gip_host::HostServices;
use gip_types::{CpuId, CpuState, GipMode, TSC_DELTA_UNKNOWN};

use crate::page::{CpuTick, GipPage, PerCpuRecord, UPDATE_HZ_RECALC_TICKS};

const NS_PER_SEC: u64 = 1_000_000_000;

/// Transactions of history warm-up before the interval outlier filter
/// engages: the seed (2), the reset window (to 7) and two full histories.
const OUTLIER_FILTER_MIN_TID: u32 = 23;

fn history_blend(history: &[u32; 8]) -> u32 {
    let first = history[..4].iter().copied().map(u64::from).sum::<u64>() >> 2;
    let second = history[4..].iter().copied().map(u64::from).sum::<u64>() >> 2;
    ((first + second) >> 1) as u32
}

/// Updates everything in the record except the sequence, which the caller's
/// write guard brackets.
fn do_update_cpu(
    page: &GipPage,
    record: &PerCpuRecord,
    tick: &mut CpuTick,
    transaction_id: u32,
    nano_ts: u64,
    tsc: u64,
    timer_tick: u64,
    test_forced: bool,
) {
    tick.prev_update_interval_ns = nano_ts.wrapping_sub(tick.nano_ts) as u32;
    tick.nano_ts = nano_ts;

    let mut tsc_delta = tsc.wrapping_sub(tick.tsc);
    tick.tsc = tsc;

    // Invariant hosts never derive the frequency from tick intervals, unless
    // test mode forces recalculation. The refiner publishes its estimate to
    // the page atomically and this tick folds it into the record, keeping
    // the tick engine the record's only seqlock writer.
    if page.mode() == GipMode::Invariant && !test_forced {
        tick.cpu_hz = page.cpu_hz();
        return;
    }

    if tsc_delta >> 32 != 0 {
        // A missed tick or a migration blew the interval up; substitute the
        // previous smoothed value.
        tsc_delta = u64::from(tick.update_interval_tsc);
        record.error_count.fetch_add(1, Ordering::Relaxed);
    }

    // The seed history is nominal at best. Rewrite it with live intervals on
    // the second and third tick, once the measured interval firms up.
    if (transaction_id == 5 || transaction_id == 7) && (timer_tick == 2 || timer_tick == 3) {
        tick.tsc_history = [tsc_delta as u32; 8];
    }

    // Interval outlier filter: once two full histories have accumulated, a
    // tick whose wall-clock interval strays more than 0.5% from nominal gets
    // its TSC interval replaced by a blend of the history halves.
    if transaction_id > OUTLIER_FILTER_MIN_TID && page.mode() != GipMode::AsyncTsc {
        let nominal = page.update_interval_ns();
        let threshold = nominal / 200;
        let prev = tick.prev_update_interval_ns;
        if prev > nominal + threshold || prev < nominal.saturating_sub(threshold) {
            tsc_delta = u64::from(history_blend(&tick.tsc_history));
        }
    }

    let head = (tick.tsc_history_head + 1) & 7;
    tick.tsc_history_head = head;
    tick.tsc_history[head as usize] = tsc_delta as u32;

    // Smoothed interval plus slack; how much history goes in depends on the
    // tick rate, slower timers get fresher but noisier values.
    let (interval, slack_shift) = if page.mode() == GipMode::Invariant || page.update_hz() >= 1000 {
        (history_blend(&tick.tsc_history), 14)
    } else if page.update_hz() >= 90 {
        let prev = tick.tsc_history[(head.wrapping_sub(1) & 7) as usize];
        ((((tsc_delta + u64::from(prev)) >> 1) as u32), 7)
    } else {
        (tsc_delta as u32, 6)
    };
    tick.update_interval_tsc = interval + (interval >> slack_shift);

    tick.cpu_hz = u64::from(interval) * NS_PER_SEC / u64::from(page.update_interval_ns().max(1));
}

fn update_record(
    page: &GipPage,
    record: &PerCpuRecord,
    nano_ts: u64,
    tsc: u64,
    timer_tick: u64,
    test_forced: bool,
    recalc_update_hz: bool,
) {
    let mut guard = record.time.begin_write();
    if guard.recovered() {
        // Interrupted another writer; the sequence was repaired, bail out.
        record.error_count.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let transaction_id = record.time.sequence();

    // Recalculate the effective update frequency from observed wall-clock
    // drift every 0x800th transaction; the host timer rarely delivers the
    // frequency it was asked for exactly.
    if recalc_update_hz
        && page.mode() != GipMode::Invariant
        && transaction_id & (UPDATE_HZ_RECALC_TICKS * 2 - 2) == 0
    {
        let last = page.nano_ts_last_update_hz.load(Ordering::Relaxed);
        if last != 0 {
            // The anchor was stored with its low bit forced to one as a
            // non-zero sentinel, so round both divisions instead of
            // truncating the off-by-one away.
            let elapsed = nano_ts.wrapping_sub(last).max(1);
            let ticks = u64::from(UPDATE_HZ_RECALC_TICKS);
            let update_hz =
                ((NS_PER_SEC * ticks + elapsed / 2) / elapsed) as u32;
            if (30..=2000).contains(&update_hz) {
                let interval = (elapsed + ticks / 2) / ticks;
                page.set_update_hz_measured(update_hz, interval as u32);
            }
        }
        page.nano_ts_last_update_hz
            .store(nano_ts | 1, Ordering::Relaxed);
    }

    do_update_cpu(
        page,
        record,
        &mut guard,
        transaction_id,
        nano_ts,
        tsc,
        timer_tick,
        test_forced,
    );
}

/// One tick of the sync/invariant update path, or the master CPU's tick in
/// async mode.
pub(crate) fn update_page(
    page: &GipPage,
    nano_ts: u64,
    tsc: u64,
    cpu: CpuId,
    timer_tick: u64,
    test_forced: bool,
) {
    let record = if page.mode() != GipMode::AsyncTsc {
        &page.cpus[0]
    } else {
        let Some((_, record)) = page.record_for_cpu(cpu) else {
            return;
        };
        record
    };
    update_record(page, record, nano_ts, tsc, timer_tick, test_forced, true);
}

/// Async-mode tick on a non-master CPU: refreshes only that CPU's record,
/// never the page-wide update frequency.
pub(crate) fn update_page_per_cpu(
    page: &GipPage,
    nano_ts: u64,
    tsc: u64,
    cpu: CpuId,
    timer_tick: u64,
    test_forced: bool,
) {
    let Some((_, record)) = page.record_for_cpu(cpu) else {
        return;
    };
    if record.state() != CpuState::Online {
        return;
    }
    update_record(page, record, nano_ts, tsc, timer_tick, test_forced, false);
}

/// Adjusts a timer tick's raw TSC by the delta of the CPU it fired on. A
/// still-unmeasured delta is treated as zero; consumers of the page do the
/// same, so both sides drift identically until the measurement lands.
pub(crate) fn delta_adjust_timer_tsc(page: &GipPage, host: &dyn HostServices, tsc: u64) -> u64 {
    if !page.deltas_applicable() {
        return tsc;
    }
    let cpu = host.current_cpu();
    let Some((_, record)) = page.record_for_cpu(cpu) else {
        return tsc;
    };
    let delta = record.tsc_delta.load(Ordering::Relaxed);
    if delta != TSC_DELTA_UNKNOWN {
        tsc.wrapping_sub(delta as u64)
    } else {
        tsc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::GipPage;

    fn sync_page() -> GipPage {
        GipPage::new(GipMode::SyncTsc, 1, CpuId(0), 1000)
    }

    fn drive(page: &GipPage, ticks: u64, interval_ns: u64, interval_tsc: u64) -> (u64, u64) {
        let mut nano = 1_000_000u64;
        let mut tsc = 4_000_000u64;
        for tick in 1..=ticks {
            nano += interval_ns;
            tsc += interval_tsc;
            update_page(page, nano, tsc, CpuId(0), tick, false);
        }
        (nano, tsc)
    }

    #[test]
    fn tick_updates_timestamps_and_derives_the_frequency() {
        let page = sync_page();
        let (nano, tsc) = drive(&page, 10, 1_000_000, 4_000_000);
        let t = page.cpus[0].time.read();
        assert_eq!(t.nano_ts, nano);
        assert_eq!(t.tsc, tsc);
        assert_eq!(t.prev_update_interval_ns, 1_000_000);
        // 4M ticks per millisecond is 4 GHz.
        assert_eq!(t.cpu_hz, 4_000_000_000);
        assert_eq!(page.cpus[0].time.sequence(), 2 + 2 * 10);
    }

    #[test]
    fn interrupted_update_is_repaired_and_skipped() {
        let page = sync_page();
        page.cpus[0].time.set_sequence(9);
        update_page(&page, 5, 5, CpuId(0), 1, false);
        assert_eq!(page.cpus[0].error_count.load(Ordering::Relaxed), 1);
        assert_eq!(page.cpus[0].time.sequence() & 1, 0);
        // The interrupted transaction only repairs parity, no data moves.
        assert_eq!(page.cpus[0].time.read().nano_ts, 0);
    }

    #[test]
    fn impossible_tsc_jump_substitutes_the_smoothed_interval() {
        let page = sync_page();
        let (nano, tsc) = drive(&page, 5, 1_000_000, 4_000_000);
        update_page(&page, nano + 1_000_000, tsc + (1 << 33), CpuId(0), 6, false);
        assert_eq!(page.cpus[0].error_count.load(Ordering::Relaxed), 1);
        let t = page.cpus[0].time.read();
        let hz = t.cpu_hz as i64;
        assert!((hz - 4_000_000_000).abs() < 200_000_000, "cpu_hz={hz}");
    }

    #[test]
    fn invariant_mode_keeps_the_calibrated_frequency() {
        let page = GipPage::new(GipMode::Invariant, 1, CpuId(0), 1000);
        page.propagate_cpu_hz(3_000_000_000);
        let (nano, tsc) = drive(&page, 10, 1_000_000, 3_000_000);
        let t = page.cpus[0].time.read();
        assert_eq!(t.cpu_hz, 3_000_000_000);
        assert_eq!(t.nano_ts, nano);
        assert_eq!(t.tsc, tsc);
    }

    #[test]
    fn invariant_tick_folds_in_a_refined_frequency() {
        let page = GipPage::new(GipMode::Invariant, 1, CpuId(0), 1000);
        page.propagate_cpu_hz(3_000_000_000);
        // Refinement publishes to the page only; the next tick carries the
        // new value into the record under the tick's own write.
        page.set_cpu_hz(3_100_000_000);
        drive(&page, 1, 1_000_000, 3_100_000);
        assert_eq!(page.cpus[0].time.read().cpu_hz, 3_100_000_000);
    }

    #[test]
    fn update_hz_recalibrates_from_observed_wall_clock() {
        let page = sync_page();
        assert_eq!(page.update_hz(), 1000);
        // Deliver ticks at 500 Hz; two recalc boundaries are enough for the
        // engine to notice (the first only anchors the timestamp).
        drive(&page, 4200, 2_000_000, 8_000_000);
        assert_eq!(page.update_hz(), 500);
        assert_eq!(page.update_interval_ns(), 2_000_000);
    }
}
