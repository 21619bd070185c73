//! Timer-driven page updates end to end on the simulated host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gip_core::{GipConfig, GipService, GipSession};
use gip_host::{HostServices, SimHost};
use gip_types::{CpuId, GipMode};

fn service_on(host: &Arc<SimHost>) -> Arc<GipService> {
    GipService::new(Arc::clone(host) as Arc<dyn HostServices>, GipConfig::default()).unwrap()
}

/// Polls until `pred` holds or a generous real-time deadline passes.
fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::yield_now();
    }
}

#[test]
fn mapped_page_ticks_forward() {
    let host = SimHost::new(1);
    let service = service_on(&host);
    let mut session = GipSession::new();
    let page = service.map_gip(&mut session).unwrap();

    wait_for("ten updates", || {
        page.cpus[0].time.read().nano_ts >= 10 * page.update_interval_ns() as u64
    });

    let a = page.cpus[0].time.read();
    wait_for("another transaction", || page.cpus[0].time.read().nano_ts > a.nano_ts);
    let b = page.cpus[0].time.read();
    assert!(b.tsc > a.tsc);
    assert_eq!(page.cpus[0].error_count.load(std::sync::atomic::Ordering::Relaxed), 0);

    service.unmap_gip(&mut session).unwrap();
}

#[test]
fn sequence_is_even_between_updates() {
    let host = SimHost::new(1);
    let service = service_on(&host);
    let mut session = GipSession::new();
    let page = service.map_gip(&mut session).unwrap();

    wait_for("a few updates", || page.cpus[0].time.read().nano_ts > 0);
    service.unmap_gip(&mut session).unwrap();

    // Timer stopped, no writer left in flight.
    assert_eq!(page.cpus[0].time.sequence() & 1, 0);
}

#[test]
fn non_invariant_frequency_tracks_the_simulated_rate() {
    let host = SimHost::builder().cpus(1).invariant_tsc(false).build();
    let service = service_on(&host);
    assert_eq!(service.page().mode(), GipMode::SyncTsc);
    let mut session = GipSession::new();
    let page = service.map_gip(&mut session).unwrap();

    // Let the interval history fill before judging the derived frequency.
    let start = page.cpus[0].time.read().nano_ts;
    wait_for("history warm-up", || {
        page.cpus[0].time.read().nano_ts >= start + 24 * page.update_interval_ns() as u64
    });

    let hz = page.cpus[0].time.read().cpu_hz as i64;
    let nominal = host.nominal_tsc_hz() as i64;
    assert!(
        (hz - nominal).abs() < nominal / 5,
        "cpu_hz={hz} nominal={nominal}"
    );
    service.unmap_gip(&mut session).unwrap();
}

#[test]
fn async_mode_updates_every_cpu_record() {
    let host = SimHost::builder().cpus(2).force_async_tsc(true).build();
    let service = service_on(&host);
    assert_eq!(service.page().mode(), GipMode::AsyncTsc);
    assert!(!service.page().deltas_applicable());

    let mut session = GipSession::new();
    let page = service.map_gip(&mut session).unwrap();

    for cpu in [CpuId(0), CpuId(1)] {
        let (index, _) = page.record_for_cpu(cpu).unwrap();
        wait_for("per-cpu ticks", || page.cpus[index].time.read().nano_ts > 0);
    }
    service.unmap_gip(&mut session).unwrap();
}

#[test]
fn unmapping_freezes_the_page() {
    let host = SimHost::new(1);
    let service = service_on(&host);
    let mut session = GipSession::new();
    let page = service.map_gip(&mut session).unwrap();

    wait_for("first ticks", || page.cpus[0].time.read().nano_ts > 0);
    service.unmap_gip(&mut session).unwrap();

    let frozen = page.cpus[0].time.read().nano_ts;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(page.cpus[0].time.read().nano_ts, frozen);
}
