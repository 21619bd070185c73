//! TSC frequency calibration against the simulated host's nominal rate.

use std::sync::Arc;
use std::time::Duration;

use gip_core::{GipConfig, GipService};
use gip_host::{HostServices, SimHost};
use gip_types::{CpuId, GipMode};

fn service_on(host: &Arc<SimHost>) -> Arc<GipService> {
    GipService::new(Arc::clone(host) as Arc<dyn HostServices>, GipConfig::default()).unwrap()
}

fn hz_error_ppm(measured: u64, nominal: u64) -> u64 {
    measured.abs_diff(nominal) * 1_000_000 / nominal
}

#[test]
fn initial_measurement_lands_near_the_nominal_rate() {
    let host = SimHost::new(2);
    let service = service_on(&host);
    assert_eq!(service.page().mode(), GipMode::Invariant);

    let hz = service.page().cpu_hz();
    let nominal = host.nominal_tsc_hz();
    // The rough boot-time measurement is allowed 1% of error.
    assert!(
        hz_error_ppm(hz, nominal) < 10_000,
        "cpu_hz={hz} nominal={nominal}"
    );
}

#[test]
fn calibrated_frequency_reaches_every_record() {
    let host = SimHost::new(3);
    let service = service_on(&host);
    let page = service.page();

    let hz = page.cpu_hz();
    for cpu in [CpuId(0), CpuId(1), CpuId(2)] {
        let (index, _) = page.record_for_cpu(cpu).unwrap();
        assert_eq!(page.cpus[index].time.read().cpu_hz, hz);
    }
}

#[test]
fn refinement_stays_within_tolerance_and_settles() {
    let host = SimHost::new(1);
    let service = service_on(&host);
    let nominal = host.nominal_tsc_hz();

    // Give the background refinement timer a few of its virtual seconds.
    std::thread::sleep(Duration::from_millis(100));

    let hz = service.page().cpu_hz();
    assert!(
        hz_error_ppm(hz, nominal) < 10_000,
        "cpu_hz={hz} nominal={nominal}"
    );
}

#[test]
fn refinement_freezes_once_the_page_has_users() {
    let host = SimHost::new(1);
    let service = service_on(&host);
    let mut session = gip_core::GipSession::new();
    service.map_gip(&mut session).unwrap();

    // Mapped consumers bake cpu_hz into their own conversion factors; give
    // the refiner time to notice the user and stand down, then the value
    // must hold still.
    std::thread::sleep(Duration::from_millis(100));
    let before = service.page().cpu_hz();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(service.page().cpu_hz(), before);
    service.unmap_gip(&mut session).unwrap();
}

#[test]
fn non_invariant_host_skips_refinement() {
    let host = SimHost::builder().cpus(1).invariant_tsc(false).build();
    let service = service_on(&host);
    assert_eq!(service.page().mode(), GipMode::SyncTsc);

    // Sync mode has no refiner; creation pays for the precise measurement
    // up front, which holds a much tighter bound than the rough seed.
    let hz = service.page().cpu_hz();
    assert!(hz_error_ppm(hz, host.nominal_tsc_hz()) < 1_000, "cpu_hz={hz}");
}
