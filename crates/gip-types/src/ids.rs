use core::fmt;

/// Host CPU identifier, as reported by the scheduler/MP layer.
///
/// Distinct from [`ApicId`] (hardware topology identity) and from
/// [`CpuSetIndex`] (dense index into the host CPU sets); keeping the three
/// spaces in separate types makes accidental cross-indexing a compile error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    /// "No CPU" marker.
    pub const NIL: CpuId = CpuId(u32::MAX);

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("CpuId(NIL)")
        } else {
            write!(f, "CpuId({})", self.0)
        }
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Local APIC identifier of a CPU.
///
/// Hyper-thread siblings share all bits but the lowest one on the hardware
/// this models, which the delta synchronizer exploits when picking masters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApicId(pub u32);

impl ApicId {
    pub const NIL: ApicId = ApicId(u32::MAX);

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == u32::MAX
    }

    /// Identity of the physical core, with the hyper-thread bit masked off.
    #[inline]
    pub const fn core(self) -> u32 {
        self.0 & !1
    }
}

impl fmt::Debug for ApicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("ApicId(NIL)")
        } else {
            write!(f, "ApicId({:#x})", self.0)
        }
    }
}

/// Dense index into the host CPU sets (0..possible_cpu_count).
pub type CpuSetIndex = usize;
