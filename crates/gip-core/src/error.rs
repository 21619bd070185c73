use gip_types::CpuId;

/// Errors surfaced by the GIP service API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GipError {
    #[error("host reports more cpus than the page can hold")]
    TooManyCpus,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("no gip record for cpu {0}")]
    InvalidCpuId(CpuId),

    #[error("cpu set index {0} is out of range or unmapped")]
    InvalidCpuIndex(usize),

    #[error("cpu {0} is offline")]
    CpuOffline(CpuId),

    #[error("cpu {0} reports inconsistent identification (duplicate or mismatched apic id)")]
    TopologyInconsistent(CpuId),

    #[error("no usable way of identifying the current cpu")]
    Unsupported,

    #[error("tsc delta measurement for cpu {0} failed")]
    MeasurementFailed(CpuId),

    #[error("tsc delta measurement for cpu {0} timed out")]
    MeasurementTimedOut(CpuId),

    #[error("tsc frequency measurement failed")]
    FreqMeasurementFailed,

    #[error("state changed mid-operation, try again")]
    TryAgain,

    #[error("operation out of order (e.g. unmap without map)")]
    WrongOrder,

    #[error("the gip is not available, it was torn down or never mapped")]
    NotMapped,

    #[error("host error: {0}")]
    Host(#[from] gip_host::HostError),
}

pub type GipResult<T> = Result<T, GipError>;
