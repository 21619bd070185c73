/// How the GIP keeps per-CPU clock data up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GipMode {
    /// TSCs are synchronized and tick at a constant rate across P-states;
    /// only the first CPU record carries live clock data.
    Invariant = 1,
    /// TSCs are synchronized but may change rate; single live record.
    SyncTsc = 2,
    /// Each CPU's TSC drifts independently; every record is updated from a
    /// per-CPU timer and consumers must use the record for the CPU they run on.
    AsyncTsc = 3,
}

impl GipMode {
    #[inline]
    pub const fn is_sync(self) -> bool {
        matches!(self, GipMode::Invariant | GipMode::SyncTsc)
    }

    pub const fn from_raw(raw: u32) -> Option<GipMode> {
        match raw {
            1 => Some(GipMode::Invariant),
            2 => Some(GipMode::SyncTsc),
            3 => Some(GipMode::AsyncTsc),
            _ => None,
        }
    }
}

/// Confidence rating for the per-CPU TSC deltas.
///
/// Ordered by decreasing confidence; the GIP-level rating only ever moves
/// toward [`TscDeltaUse::NotZero`] as measurement evidence accumulates, never
/// back. Consumers that see `ZeroClaimed` or better may skip delta application
/// entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum TscDeltaUse {
    /// Deltas are meaningless in this mode (async TSC).
    NotApplicable = 0,
    /// The platform claims zero deltas (invariant TSC, no measurement ran).
    ZeroClaimed = 1,
    /// Every measured delta was within the practically-zero threshold.
    PracticallyZero = 2,
    /// Every measured delta was within the roughly-zero threshold.
    RoughlyZero = 3,
    /// At least one CPU has a delta large enough to require application.
    NotZero = 4,
}

impl TscDeltaUse {
    pub const fn from_raw(raw: u32) -> Option<TscDeltaUse> {
        match raw {
            0 => Some(TscDeltaUse::NotApplicable),
            1 => Some(TscDeltaUse::ZeroClaimed),
            2 => Some(TscDeltaUse::PracticallyZero),
            3 => Some(TscDeltaUse::RoughlyZero),
            4 => Some(TscDeltaUse::NotZero),
            _ => None,
        }
    }
}

/// Lifecycle state of a per-CPU GIP record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuState {
    /// Slot never used, or torn down.
    Invalid = 0,
    /// Slot belongs to a CPU that has been online but currently is not.
    Offline = 1,
    /// CPU is online and the record is live.
    Online = 2,
}

impl CpuState {
    pub const fn from_raw(raw: u32) -> Option<CpuState> {
        match raw {
            0 => Some(CpuState::Invalid),
            1 => Some(CpuState::Offline),
            2 => Some(CpuState::Online),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_use_ordering_tracks_confidence_loss() {
        assert!(TscDeltaUse::ZeroClaimed < TscDeltaUse::PracticallyZero);
        assert!(TscDeltaUse::PracticallyZero < TscDeltaUse::RoughlyZero);
        assert!(TscDeltaUse::RoughlyZero < TscDeltaUse::NotZero);
    }

    #[test]
    fn raw_round_trips() {
        for mode in [GipMode::Invariant, GipMode::SyncTsc, GipMode::AsyncTsc] {
            assert_eq!(GipMode::from_raw(mode as u32), Some(mode));
        }
        assert_eq!(GipMode::from_raw(0), None);
        for state in [CpuState::Invalid, CpuState::Offline, CpuState::Online] {
            assert_eq!(CpuState::from_raw(state as u32), Some(state));
        }
    }
}
