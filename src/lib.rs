//! Fixed-capacity hash maps built on funnel hashing.
//!
//! A [`FunnelHashMap`] is sized once, at construction, for a logical capacity.
//! Its slots are split into geometrically shrinking levels of fixed-width
//! buckets followed by a small backyard. Each key has a deterministic candidate
//! sequence (one bucket per level, then up to two backyard buckets), so every
//! operation inspects a bounded number of slots no matter how full the map is.
//!
//! ```
//! use funnel_hash::{FunnelError, FunnelHashMap};
//!
//! let mut map = FunnelHashMap::with_capacity(2)?;
//! map.insert("a", 1)?;
//! map.insert("b", 2)?;
//! assert_eq!(
//!     map.insert("c", 3),
//!     Err(FunnelError::CapacityExceeded { capacity: 2 })
//! );
//!
//! assert_eq!(map.remove("a"), Some(1));
//! map.insert("c", 3)?;
//! assert_eq!(map["c"], 3);
//! # Ok::<(), FunnelError>(())
//! ```

mod common;
mod error;
mod funnel;
mod layout;

pub use error::{FunnelError, Result};
pub use funnel::{FunnelHashMap, IntoIter, Iter};
pub use layout::{Candidate, Candidates, FunnelConfig, Layout, Region, Span};
