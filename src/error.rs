//! Error types for funnel hash maps.

use thiserror::Error;

/// Result type alias for fallible map operations.
pub type Result<T> = std::result::Result<T, FunnelError>;

/// Failures reported by [`FunnelHashMap`](crate::FunnelHashMap).
///
/// `CapacityExceeded` and `KeyNotFound` are ordinary, caller-recoverable
/// outcomes. `StructuralOverflow` means the layout's overcommit did not hold
/// for this key distribution and should be treated as a hard failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FunnelError {
    /// A map was requested with a logical capacity of zero.
    #[error("invalid capacity: a funnel hash map must hold at least one entry")]
    InvalidCapacity,

    /// A new key was inserted while the map already held `capacity` entries.
    #[error("capacity exceeded: map already holds {capacity} entries")]
    CapacityExceeded { capacity: usize },

    /// Every slot in the key's candidate sequence was occupied even though the
    /// map was below its logical capacity.
    #[error("structural overflow: no free slot in candidate sequence ({len}/{capacity} entries)")]
    StructuralOverflow { len: usize, capacity: usize },

    /// The requested key is not present.
    #[error("key not found")]
    KeyNotFound,
}

impl FunnelError {
    /// Returns true for conditions the caller is expected to handle.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FunnelError::StructuralOverflow { .. })
    }
}
