//! End-to-end scenario: a four-CPU host with skewed TSCs goes through the
//! whole lifecycle — creation, mapping, reads, hotplug, suspend/resume,
//! teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gip::{GipConfig, GipService, GipSession};
use gip_core::MeasureFlags;
use gip_host::{HostServices, SimHost};
use gip_types::{CpuId, GipMode, TscDeltaUse, TSC_DELTA_UNKNOWN};

fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::yield_now();
    }
}

#[test]
fn full_lifecycle_on_a_skewed_smp_host() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let host = SimHost::new(4);
    host.set_tsc_offset(CpuId(1), 50_000);
    host.set_tsc_offset(CpuId(2), -30_000);

    let service =
        GipService::new(Arc::clone(&host) as Arc<dyn HostServices>, GipConfig::default()).unwrap();
    let page = Arc::clone(service.page());
    assert!(page.is_valid());
    assert_eq!(page.mode(), GipMode::Invariant);
    assert_eq!(page.online_count(), 4);
    assert_eq!(page.use_tsc_delta(), TscDeltaUse::NotZero);

    for (cpu, skew) in [(CpuId(1), 50_000i64), (CpuId(2), -30_000), (CpuId(3), 0)] {
        let (_, record) = page.record_for_cpu(cpu).unwrap();
        let delta = record.tsc_delta();
        assert!((delta - skew).abs() <= 200, "cpu={} delta={delta}", cpu.0);
    }

    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();
    wait_for("update ticks", || page.cpus[0].time.read().nano_ts > 0);

    // Adjusted reads taken in cross-CPU succession stay ordered despite the
    // injected skew.
    let mut last = service.read_adjusted_tsc(&session).unwrap();
    for cpu in [CpuId(1), CpuId(2), CpuId(3), CpuId(0)] {
        let read = Arc::new(AtomicU64::new(0));
        {
            let read = Arc::clone(&read);
            let service = Arc::clone(&service);
            let session = &session;
            host.run_on_cpu(cpu, &|| {
                read.store(service.read_adjusted_tsc(session).unwrap(), Ordering::SeqCst);
            })
            .unwrap();
        }
        let read = read.load(Ordering::SeqCst);
        assert!(read > last, "cpu={} read={read} last={last}", cpu.0);
        last = read;
    }

    // Master failover under load, then the replug gets remeasured.
    let old_master = service.master_cpu();
    host.set_cpu_offline(old_master);
    let new_master = service.master_cpu();
    assert_ne!(new_master, old_master);
    host.set_cpu_online(old_master);
    wait_for("replugged cpu measured", || {
        let (_, record) = page.record_for_cpu(old_master).unwrap();
        record.tsc_delta() != TSC_DELTA_UNKNOWN
    });

    // Suspend wipes nothing; resume remeasures everything. Deltas are
    // relative to whoever is master now, skew included.
    host.suspend();
    host.set_tsc_offset(CpuId(3), 12_000);
    host.resume();
    let (_, record) = page.record_for_cpu(CpuId(3)).unwrap();
    let delta = record.tsc_delta();
    let expected = 12_000 - host.tsc_offset(new_master);
    assert!((delta - expected).abs() <= 200, "delta={delta} expected={expected}");

    // An explicit forced remeasure through the public API still works.
    service
        .measure_delta_for_cpu(&session, 3, MeasureFlags::FORCE)
        .unwrap();

    service.unmap_gip(&mut session).unwrap();
    drop(service);
    assert!(!page.is_valid());
}
