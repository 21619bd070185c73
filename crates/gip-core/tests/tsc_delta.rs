//! Cross-CPU TSC delta measurement against the simulated host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gip_core::{GipConfig, GipError, GipService, GipSession, MeasureFlags};
use gip_host::{HostServices, SimHost};
use gip_types::{CpuId, TscDeltaUse, TSC_DELTA_UNKNOWN};

fn service_on(host: &Arc<SimHost>) -> Arc<GipService> {
    GipService::new(Arc::clone(host) as Arc<dyn HostServices>, GipConfig::default()).unwrap()
}

fn worker_delta(service: &GipService, cpu: CpuId) -> i64 {
    let (_, record) = service.page().record_for_cpu(cpu).unwrap();
    record.tsc_delta()
}

#[test]
fn unskewed_host_rates_deltas_practically_zero() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    assert_eq!(service.page().use_tsc_delta(), TscDeltaUse::PracticallyZero);
    let delta = worker_delta(&service, CpuId(1));
    assert_ne!(delta, TSC_DELTA_UNKNOWN);
    assert!(delta.abs() <= 32, "delta={delta}");
}

#[test]
fn injected_offset_is_recovered_within_tolerance() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();
    host.set_tsc_offset(CpuId(1), 1000);

    let mut hits = 0;
    for _ in 0..100 {
        service
            .measure_delta_for_cpu(&session, 1, MeasureFlags::FORCE)
            .unwrap();
        let delta = worker_delta(&service, CpuId(1));
        assert_ne!(delta, TSC_DELTA_UNKNOWN);
        if (delta - 1000).abs() <= 50 {
            hits += 1;
        }
    }
    assert!(hits >= 95, "only {hits}/100 trials within 50 ticks");
    assert_eq!(service.page().use_tsc_delta(), TscDeltaUse::NotZero);
    service.unmap_gip(&mut session).unwrap();
}

#[test]
fn confidence_only_ever_degrades() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();

    host.set_tsc_offset(CpuId(1), 100_000);
    service
        .measure_delta_for_cpu(&session, 1, MeasureFlags::FORCE)
        .unwrap();
    assert_eq!(service.page().use_tsc_delta(), TscDeltaUse::NotZero);

    // The skew going away again must not win the confidence back.
    host.set_tsc_offset(CpuId(1), 0);
    service
        .measure_delta_for_cpu(&session, 1, MeasureFlags::FORCE)
        .unwrap();
    assert!(worker_delta(&service, CpuId(1)).abs() <= 32);
    assert_eq!(service.page().use_tsc_delta(), TscDeltaUse::NotZero);
}

#[test]
fn known_delta_is_kept_without_force() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();

    let before = worker_delta(&service, CpuId(1));
    assert_ne!(before, TSC_DELTA_UNKNOWN);
    host.set_tsc_offset(CpuId(1), 9_000);
    service
        .measure_delta_for_cpu(&session, 1, MeasureFlags::empty())
        .unwrap();
    assert_eq!(worker_delta(&service, CpuId(1)), before);
}

#[test]
fn measuring_the_master_is_a_fixed_zero() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();

    let master = service.master_cpu();
    service
        .measure_delta_for_cpu(&session, master.0 as usize, MeasureFlags::FORCE)
        .unwrap();
    assert_eq!(worker_delta(&service, master), 0);
}

#[test]
fn measuring_an_offline_cpu_fails() {
    let host = SimHost::new(3);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();

    host.set_cpu_offline(CpuId(2));
    let err = service
        .measure_delta_for_cpu(&session, 2, MeasureFlags::FORCE)
        .unwrap_err();
    assert!(matches!(err, GipError::CpuOffline(_)), "err={err}");
}

#[test]
fn measurement_requires_a_mapped_session() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    let session = GipSession::new();
    let err = service
        .measure_delta_for_cpu(&session, 1, MeasureFlags::FORCE)
        .unwrap_err();
    assert!(matches!(err, GipError::WrongOrder));
}

#[test]
fn adjusted_reads_stay_ordered_across_skewed_cpus() {
    let host = SimHost::new(2);
    host.set_tsc_offset(CpuId(1), 1_000_000);
    let service = service_on(&host);
    let mut session = GipSession::new();
    service.map_gip(&mut session).unwrap();

    let first = service.read_adjusted_tsc(&session).unwrap();
    let second = Arc::new(AtomicU64::new(0));
    {
        let second = Arc::clone(&second);
        let service = Arc::clone(&service);
        let session = &session;
        host.run_on_cpu(CpuId(1), &|| {
            second.store(service.read_adjusted_tsc(session).unwrap(), Ordering::SeqCst);
        })
        .unwrap();
    }
    let second = second.load(Ordering::SeqCst);
    assert!(second > first, "second={second} first={first}");
    // A raw read on CPU 1 would be at least the injected megatick ahead;
    // adjusted reads only move by the real elapsed time.
    assert!(second - first < 500_000, "gap={}", second - first);
}

#[test]
fn resume_remeasures_every_worker_delta() {
    let host = SimHost::new(3);
    let service = service_on(&host);

    host.set_tsc_offset(CpuId(1), 4_000);
    host.set_tsc_offset(CpuId(2), 7_000);
    host.suspend();
    host.resume();

    for (cpu, skew) in [(CpuId(1), 4_000i64), (CpuId(2), 7_000)] {
        let delta = worker_delta(&service, cpu);
        assert!((delta - skew).abs() <= 200, "cpu={} delta={delta}", cpu.0);
    }
}
