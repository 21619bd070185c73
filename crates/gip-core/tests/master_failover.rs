//! Master CPU election across hotplug events.

use std::sync::Arc;

use gip_core::{GipConfig, GipService};
use gip_host::{HostServices, SimHost};
use gip_types::{CpuId, CpuState, TSC_DELTA_UNKNOWN};

fn service_on(host: &Arc<SimHost>) -> Arc<GipService> {
    GipService::new(Arc::clone(host) as Arc<dyn HostServices>, GipConfig::default()).unwrap()
}

#[test]
fn boot_cpu_is_the_initial_master() {
    let host = SimHost::new(4);
    let service = service_on(&host);
    assert_eq!(service.master_cpu(), CpuId(0));
    let (_, master) = service.page().record_for_cpu(CpuId(0)).unwrap();
    assert_eq!(master.tsc_delta(), 0);
}

#[test]
fn offlining_the_master_elects_a_successor() {
    let host = SimHost::new(4);
    let service = service_on(&host);
    let old = service.master_cpu();

    host.set_cpu_offline(old);

    let new = service.master_cpu();
    assert_ne!(new, old);
    assert!(host.is_cpu_online(new));

    let (_, old_record) = service.page().record_for_cpu(old).unwrap();
    assert_eq!(old_record.state(), CpuState::Offline);
    assert_eq!(old_record.tsc_delta(), TSC_DELTA_UNKNOWN);

    // The successor becomes the new delta reference.
    let (_, new_record) = service.page().record_for_cpu(new).unwrap();
    assert_eq!(new_record.tsc_delta(), 0);
}

#[test]
fn offlining_a_worker_keeps_the_master() {
    let host = SimHost::new(4);
    let service = service_on(&host);
    let master = service.master_cpu();

    host.set_cpu_offline(CpuId(2));

    assert_eq!(service.master_cpu(), master);
    assert_eq!(service.page().online_count(), 3);
    let (_, record) = service.page().record_for_cpu(CpuId(2)).unwrap();
    assert_eq!(record.tsc_delta(), TSC_DELTA_UNKNOWN);
}

#[test]
fn replugged_cpu_is_remeasured_against_the_master() {
    let host = SimHost::new(3);
    let service = service_on(&host);

    host.set_cpu_offline(CpuId(1));
    host.set_tsc_offset(CpuId(1), 6_000);
    host.set_cpu_online(CpuId(1));

    assert_eq!(service.page().online_count(), 3);
    let (_, record) = service.page().record_for_cpu(CpuId(1)).unwrap();
    assert_eq!(record.state(), CpuState::Online);
    let delta = record.tsc_delta();
    assert_ne!(delta, TSC_DELTA_UNKNOWN);
    assert!((delta - 6_000).abs() <= 200, "delta={delta}");
}
