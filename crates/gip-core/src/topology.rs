//! CPU identification probing.
//!
//! Userland consumers of the page need a cheap way to figure out which CPU
//! record applies to them. Several lookup paths exist (APIC ID via the
//! extended topology leaf, the AMD extended leaf, or the legacy 8-bit APIC
//! byte); not every path is reliable on every part, so each online CPU is
//! probed and the page only advertises the methods that checked out on all
//! of them. Duplicate APIC IDs or a broken cpu-id/set-index round trip are
//! hard errors naming the offending CPU.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use gip_host::{ApicIdSource, HostServices};
use gip_types::{ApicId, CpuId};

use crate::error::{GipError, GipResult};
use crate::page::APIC_MAP_ENTRIES;

bitflags! {
    /// Lookup paths usable on every online CPU.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuLookupMethods: u32 {
        const APIC_ID_LEGACY = 1 << 0;
        const APIC_ID_EXT_0B = 1 << 1;
        const APIC_ID_EXT_8000001E = 1 << 2;
    }
}

pub(crate) fn method_for(source: ApicIdSource) -> CpuLookupMethods {
    match source {
        ApicIdSource::Legacy => CpuLookupMethods::APIC_ID_LEGACY,
        ApicIdSource::ExtLeaf0B => CpuLookupMethods::APIC_ID_EXT_0B,
        ApicIdSource::ExtLeaf8000001E => CpuLookupMethods::APIC_ID_EXT_8000001E,
    }
}

/// Sources in order of preference, widest first.
const PREFERRED: [ApicIdSource; 3] =
    [ApicIdSource::ExtLeaf0B, ApicIdSource::ExtLeaf8000001E, ApicIdSource::Legacy];

/// The current CPU's APIC ID using only methods in `methods`, falling back
/// to probing every source when the mask gives nothing (slow path).
pub(crate) fn resolve_apic_id(host: &dyn HostServices, methods: CpuLookupMethods) -> Option<ApicId> {
    for source in PREFERRED {
        if methods.contains(method_for(source)) {
            if let Some(apic) = host.apic_id_via(source) {
                return Some(apic);
            }
        }
    }
    resolve_apic_id_slow(host)
}

/// Probes every source directly, cross-checking the answers against each
/// other. Used before detection has run and as the fallback path.
pub(crate) fn resolve_apic_id_slow(host: &dyn HostServices) -> Option<ApicId> {
    let mut found: Option<ApicId> = None;
    for source in PREFERRED {
        if let Some(apic) = host.apic_id_via(source) {
            match found {
                None => found = Some(apic),
                Some(prev) if prev != apic => {
                    tracing::warn!(
                        cpu = host.current_cpu().0,
                        "apic id sources disagree: {prev:?} vs {apic:?} via {source:?}"
                    );
                }
                Some(_) => {}
            }
        }
    }
    found
}

/// Shared state for the all-CPU detection sweep.
struct DetectState {
    /// Methods that have survived every CPU so far; starts all-ones.
    supported: AtomicU32,
    /// First CPU with a hard identification problem, `CpuId::NIL` if none.
    problem_cpu: AtomicU32,
    /// APIC IDs seen during the sweep, for duplicate detection.
    seen_apics: [AtomicU64; APIC_MAP_ENTRIES / 64],
}

impl DetectState {
    fn new() -> DetectState {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        DetectState {
            supported: AtomicU32::new(u32::MAX),
            problem_cpu: AtomicU32::new(CpuId::NIL.0),
            seen_apics: [ZERO; APIC_MAP_ENTRIES / 64],
        }
    }

    fn flag_problem(&self, cpu: CpuId) {
        let _ = self.problem_cpu.compare_exchange(
            CpuId::NIL.0,
            cpu.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Atomically records an APIC ID; true if it was already present.
    fn test_and_set_apic(&self, apic: ApicId) -> bool {
        let idx = apic.0 as usize;
        if idx >= APIC_MAP_ENTRIES {
            return false;
        }
        let prev = self.seen_apics[idx / 64].fetch_or(1 << (idx % 64), Ordering::AcqRel);
        prev & (1 << (idx % 64)) != 0
    }
}

/// One CPU's contribution to the sweep; runs on the CPU it validates.
fn detect_on_cpu(host: &dyn HostServices, state: &DetectState) {
    let cpu = host.current_cpu();

    // The dense set index must round-trip back to this CPU.
    let round_trip_ok = host
        .cpu_set_index_of(cpu)
        .and_then(|index| host.cpu_at_set_index(index))
        .is_some_and(|back| back == cpu);
    if !round_trip_ok {
        tracing::warn!(cpu = cpu.0, "cpu id / set index round trip failed");
        state.flag_problem(cpu);
        return;
    }

    let mut my_methods = CpuLookupMethods::empty();
    let mut resolved: Option<ApicId> = None;
    for source in PREFERRED {
        match host.apic_id_via(source) {
            Some(apic) => {
                if source == ApicIdSource::Legacy && apic.0 >= 256 {
                    // The legacy byte cannot express this CPU.
                    continue;
                }
                match resolved {
                    None => {
                        resolved = Some(apic);
                        my_methods |= method_for(source);
                    }
                    Some(prev) if prev == apic => my_methods |= method_for(source),
                    Some(prev) => {
                        tracing::warn!(
                            cpu = cpu.0,
                            "apic source {source:?} reports {apic:?}, others said {prev:?}; \
                             dropping it"
                        );
                    }
                }
            }
            None => {}
        }
    }

    let Some(apic) = resolved else {
        tracing::warn!(cpu = cpu.0, "no apic id source works on this cpu");
        state.flag_problem(cpu);
        return;
    };
    if state.test_and_set_apic(apic) {
        tracing::warn!(cpu = cpu.0, apic = apic.0, "duplicate apic id");
        state.flag_problem(cpu);
        return;
    }

    state.supported.fetch_and(my_methods.bits(), Ordering::AcqRel);
}

/// Probes every online CPU and returns the intersection of usable lookup
/// methods. An empty intersection means userland has no reliable way to
/// identify its CPU.
pub(crate) fn detect_lookup_methods(host: &dyn HostServices) -> GipResult<CpuLookupMethods> {
    let state = DetectState::new();
    host.run_on_all_online(&|_cpu| detect_on_cpu(host, &state))?;

    let problem = CpuId(state.problem_cpu.load(Ordering::Acquire));
    if !problem.is_nil() {
        return Err(GipError::TopologyInconsistent(problem));
    }

    let supported = state.supported.load(Ordering::Acquire);
    if supported == u32::MAX || supported == 0 {
        // Either no CPU reported (shouldn't happen) or nothing is usable
        // everywhere.
        if supported == 0 {
            tracing::warn!("no cpu lookup method works on every online cpu");
            return Err(GipError::Unsupported);
        }
        return Err(GipError::TryAgain);
    }
    Ok(CpuLookupMethods::from_bits_truncate(supported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gip_host::SimHost;
    use gip_types::CpuId;

    #[test]
    fn detection_accepts_a_healthy_host() {
        let host = SimHost::new(4);
        let methods = detect_lookup_methods(&*host).unwrap();
        assert_eq!(
            methods,
            CpuLookupMethods::APIC_ID_LEGACY
                | CpuLookupMethods::APIC_ID_EXT_0B
                | CpuLookupMethods::APIC_ID_EXT_8000001E
        );
    }

    #[test]
    fn disagreeing_source_loses_its_method_bit() {
        let host = SimHost::new(2);
        host.set_apic_id_for_source(CpuId(1), ApicIdSource::ExtLeaf8000001E, ApicId(200));
        let methods = detect_lookup_methods(&*host).unwrap();
        assert!(methods.contains(CpuLookupMethods::APIC_ID_EXT_0B));
        assert!(!methods.contains(CpuLookupMethods::APIC_ID_EXT_8000001E));
    }

    #[test]
    fn duplicate_apic_id_names_the_offender() {
        let host = SimHost::new(3);
        host.set_apic_id(CpuId(2), ApicId(0));
        let err = detect_lookup_methods(&*host).unwrap_err();
        match err {
            GipError::TopologyInconsistent(cpu) => {
                // One of the two claimants gets flagged; which one depends on
                // sweep order.
                assert!(cpu == CpuId(0) || cpu == CpuId(2));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn all_sources_disabled_is_unsupported() {
        let host = SimHost::new(2);
        for source in ApicIdSource::ALL {
            host.disable_apic_source(CpuId(1), source);
        }
        let err = detect_lookup_methods(&*host).unwrap_err();
        assert_eq!(err, GipError::TopologyInconsistent(CpuId(1)));
    }

    #[test]
    fn resolution_honors_the_advertised_method_mask() {
        let host = SimHost::new(2);
        host.set_apic_id_for_source(CpuId(1), ApicIdSource::ExtLeaf8000001E, ApicId(200));
        host.run_on_cpu(CpuId(1), &|| {
            // The mask picks the source; an empty mask falls back to probing
            // everything, which lands on the widest source first.
            assert_eq!(
                resolve_apic_id(&*host, CpuLookupMethods::APIC_ID_EXT_8000001E),
                Some(ApicId(200))
            );
            assert_eq!(
                resolve_apic_id(&*host, CpuLookupMethods::empty()),
                Some(ApicId(1))
            );
        })
        .unwrap();
    }

    #[test]
    fn slow_path_resolves_from_any_source() {
        let host = SimHost::new(2);
        host.disable_apic_source(CpuId(1), ApicIdSource::ExtLeaf0B);
        host.run_on_cpu(CpuId(1), &|| {
            assert_eq!(resolve_apic_id_slow(&*host), Some(ApicId(1)));
        })
        .unwrap();
    }
}
