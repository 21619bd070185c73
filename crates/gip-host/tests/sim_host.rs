use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use gip_host::{HostServices, MpEvent, TimerAffinity, TimerTick};
use gip_host::SimHost;
use gip_types::{ApicId, CpuId};

#[test]
fn virtual_clock_advances_on_sleep_not_wall_time() {
    let host = SimHost::new(1);
    let before = host.nano_ts();
    host.sleep_ns(5_000_000_000); // five virtual seconds
    let after = host.nano_ts();
    assert!(after - before >= 5_000_000_000, "before={before} after={after}");
}

#[test]
fn nano_ts_is_strictly_increasing() {
    let host = SimHost::new(1);
    let mut prev = host.nano_ts();
    for _ in 0..1000 {
        let now = host.nano_ts();
        assert!(now > prev);
        prev = now;
    }
}

#[test]
fn read_tsc_reflects_injected_offset() {
    let host = SimHost::new(2);
    host.set_tsc_offset(CpuId(1), 1_000_000);

    let t0 = AtomicU64::new(0);
    let t1 = AtomicU64::new(0);
    host.run_on_cpu(CpuId(0), &|| t0.store(host.read_tsc(), Ordering::SeqCst))
        .unwrap();
    host.run_on_cpu(CpuId(1), &|| t1.store(host.read_tsc(), Ordering::SeqCst))
        .unwrap();

    // Virtual TSC reads are globally ordered, so the later read on cpu1 must
    // exceed the cpu0 read by at least the injected skew.
    let diff = t1.load(Ordering::SeqCst) as i64 - t0.load(Ordering::SeqCst) as i64;
    assert!(diff >= 1_000_000, "diff={diff}");
    assert!(diff < 1_100_000, "diff={diff} (skew should dominate)");
}

#[test]
fn current_cpu_is_set_inside_cross_calls() {
    let host = SimHost::new(3);
    for i in 0..3 {
        let cpu = CpuId(i);
        let seen = Mutex::new(CpuId::NIL);
        host.run_on_cpu(cpu, &|| *seen.lock().unwrap() = host.current_cpu())
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), cpu);
    }
}

#[test]
fn run_on_pair_executes_both_sides_concurrently() {
    let host = SimHost::new(2);
    let barrier = Barrier::new(2);
    // Would deadlock if the two halves were serialized.
    host.run_on_pair(CpuId(0), CpuId(1), &|_cpu| {
        barrier.wait();
    })
    .unwrap();
}

#[test]
fn run_on_all_online_skips_offline_cpus() {
    let host = SimHost::new(4);
    host.set_cpu_offline(CpuId(2));
    let hits = AtomicUsize::new(0);
    host.run_on_all_online(&|cpu| {
        assert_ne!(cpu, CpuId(2));
        hits.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn run_on_all_online_visits_every_cpu_exactly_once() {
    let host = SimHost::new(4);
    let hits: Mutex<Vec<usize>> = Mutex::new(vec![0; 4]);
    // Slow workers force the fan-out to keep every argument closure alive
    // until the last receiver drains; a stale closure would report the wrong
    // cpu id or double-count a slot.
    host.run_on_all_online(&|cpu| {
        assert_eq!(host.current_cpu(), cpu);
        std::thread::sleep(std::time::Duration::from_millis(2));
        hits.lock().unwrap()[cpu.0 as usize] += 1;
    })
    .unwrap();
    assert_eq!(*hits.lock().unwrap(), vec![1, 1, 1, 1]);
}

#[test]
fn offline_cpu_rejects_cross_calls() {
    let host = SimHost::new(2);
    host.set_cpu_offline(CpuId(1));
    let err = host.run_on_cpu(CpuId(1), &|| {}).unwrap_err();
    assert_eq!(err, gip_host::HostError::CpuOffline(CpuId(1)));
}

#[test]
fn mp_observer_sees_online_and_offline_events() {
    let host = SimHost::new(2);
    let events: Arc<Mutex<Vec<(MpEvent, CpuId)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    host.set_mp_observer(Some(Arc::new(move |event, cpu| {
        sink.lock().unwrap().push((event, cpu));
    })));

    host.set_cpu_offline(CpuId(1));
    host.set_cpu_online(CpuId(1));
    // No event when the state does not change.
    host.set_cpu_online(CpuId(1));

    let got = events.lock().unwrap().clone();
    assert_eq!(got, vec![(MpEvent::Offline, CpuId(1)), (MpEvent::Online, CpuId(1))]);
}

#[test]
fn apic_sources_can_be_overridden_and_disabled() {
    let host = SimHost::new(2);
    host.set_apic_id(CpuId(1), ApicId(9));
    host.disable_apic_source(CpuId(1), gip_host::ApicIdSource::ExtLeaf8000001E);

    host.run_on_cpu(CpuId(1), &|| {
        assert_eq!(host.apic_id_via(gip_host::ApicIdSource::ExtLeaf0B), Some(ApicId(9)));
        assert_eq!(host.apic_id_via(gip_host::ApicIdSource::ExtLeaf8000001E), None);
        assert_eq!(host.apic_id_via(gip_host::ApicIdSource::Legacy), Some(ApicId(9)));
    })
    .unwrap();
}

#[test]
fn timer_fires_with_increasing_ticks_until_stopped() {
    let host = SimHost::new(1);
    let last_tick = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&last_tick);
    let timer = host
        .create_timer(
            1_000_000,
            TimerAffinity::Any,
            Arc::new(move |tick: TimerTick| {
                let prev = sink.swap(tick.tick, Ordering::SeqCst);
                assert!(tick.tick > prev);
            }),
        )
        .unwrap();

    timer.start(1_000_000).unwrap();
    while last_tick.load(Ordering::SeqCst) < 16 {
        std::thread::yield_now();
    }
    timer.stop().unwrap();
    let frozen = last_tick.load(Ordering::SeqCst);
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(last_tick.load(Ordering::SeqCst), frozen, "timer kept firing after stop");
}

#[test]
fn specific_affinity_timer_runs_on_its_cpu() {
    let host = SimHost::new(2);
    let hits = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&hits);
    let host2 = Arc::clone(&host);
    let timer = host
        .create_timer(
            500_000,
            TimerAffinity::Specific(CpuId(1)),
            Arc::new(move |tick: TimerTick| {
                assert_eq!(tick.cpu, CpuId(1));
                assert_eq!(host2.current_cpu(), CpuId(1));
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    timer.start(500_000).unwrap();
    while hits.load(Ordering::SeqCst) < 4 {
        std::thread::yield_now();
    }
    timer.stop().unwrap();
}

#[test]
fn masquerading_sets_current_cpu_for_the_caller_only() {
    let host = SimHost::new(2);
    assert_eq!(host.current_cpu(), CpuId(0));
    host.with_current_cpu(CpuId(1), || {
        assert_eq!(host.current_cpu(), CpuId(1));
    });
    assert_eq!(host.current_cpu(), CpuId(0));
}
