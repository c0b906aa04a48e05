use crate::host::Direction;
use thiserror::Error;

/// Failures reported by the host collaborators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("host page allocator has no block of order {order}")]
    OutOfMemory { order: u32 },
    #[error("bus mapping at {iova:#x} failed: {reason}")]
    MapFailed { iova: u64, reason: &'static str },
    #[error("address {addr:#x} is not aligned to {align:#x}")]
    Unaligned { addr: usize, align: usize },
}

/// A broken invariant. Never recoverable: continuing would risk the device
/// reading or writing memory it does not own.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("unit locality {found} does not match requesting locality {expected}")]
    LocalityMismatch { expected: u8, found: u8 },
    #[error("direction {requested:?} does not match mapped direction {mapped:?}")]
    DirectionMismatch {
        mapped: Direction,
        requested: Direction,
    },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: u64 },
    #[error("{addr:#x} was not produced by this cache")]
    InvalidAddress { addr: u64 },
    #[error("no unit registered for {addr:#x}")]
    UnknownUnit { addr: u64 },
    #[error("bus mapper placed unit at {returned:#x}, expected {requested:#x}")]
    MappingMismatch { requested: u64, returned: u64 },
    #[error("{addr:#x} has no live shadow mapping")]
    NotMapped { addr: u64 },
    #[error("shadow entry for {addr:#x} is already live")]
    EntryInUse { addr: u64 },
    #[error("cached object state is corrupt: {what}")]
    CorruptCache { what: &'static str },
}

/// Configuration rejected by [`crate::config::CacheConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unit shift {0} outside supported range")]
    UnitShift(u32),
    #[error("fragment alignment {0} must be a power of two no larger than a page")]
    FragAlign(usize),
    #[error("oversize order {0} too large")]
    OversizeOrder(u32),
    #[error("locality count {0} must be between 1 and 32")]
    Localities(usize),
    #[error("unit registry capacity {0} does not fit the address layout")]
    Capacity(usize),
    #[error("environment variable {name} is not a number: {value:?}")]
    Parse { name: &'static str, value: String },
}

/// Errors returned by the cache and shadow layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// The host could not supply or map a new unit.
    #[error("exhausted: {0}")]
    Exhausted(#[from] HostError),
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("capacity of key {key} exhausted")]
    CapacityExceeded { key: usize },
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DmaError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, DmaError::Integrity(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, DmaError::Exhausted(_) | DmaError::CapacityExceeded { .. })
    }

    pub fn integrity(&self) -> Option<IntegrityViolation> {
        match self {
            DmaError::Integrity(v) => Some(*v),
            _ => None,
        }
    }
}

/// Log an integrity violation at error level and wrap it.
#[cold]
pub(crate) fn violation(v: IntegrityViolation) -> DmaError {
    log::error!("dmacache: {}", v);
    DmaError::Integrity(v)
}

pub type Result<T, E = DmaError> = core::result::Result<T, E>;
