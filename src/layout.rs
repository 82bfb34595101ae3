//! Slot layout and candidate sequences.
//!
//! A [`Layout`] is computed once from the logical capacity and the reserve
//! fraction. It never looks at table contents, so the candidate sequence of a
//! key is a pure function of `(key hash, layout)`.

use std::iter::FusedIterator;
use std::ops::{Range, RangeInclusive};

use tracing::debug;

use crate::common::{DEFAULT_RESERVE_FRACTION, mix64, sanitize_reserve_fraction};
use crate::error::{FunnelError, Result};

const LEVEL_SALT: u64 = 0x9E37_79B9_7F4A_7C15;
const BACKYARD_SALT_FIRST: u64 = 0xA5A5_A5A5_A5A5_A5A5;
const BACKYARD_SALT_STEP: u64 = 0x5A5A_5A5A_5A5A_5A5A;

/// Slots per backyard bucket once the backyard spans more than one bucket.
pub const BACKYARD_BUCKET_WIDTH: usize = 16;

/// Tuning knobs for a funnel hash map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunnelConfig {
    reserve_fraction: f64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            reserve_fraction: DEFAULT_RESERVE_FRACTION,
        }
    }
}

impl FunnelConfig {
    /// `reserve_fraction` is the share of physical slots kept free when the map
    /// is at capacity (δ). It is clamped to `[1e-6, 1/8]`; non-finite values
    /// fall back to the default of 1/8.
    pub fn with_reserve_fraction(reserve_fraction: f64) -> Self {
        Self {
            reserve_fraction: sanitize_reserve_fraction(reserve_fraction),
        }
    }

    pub fn reserve_fraction(&self) -> f64 {
        self.reserve_fraction
    }
}

/// A run of equally sized buckets inside the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub bucket_count: usize,
    pub bucket_width: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.bucket_count * self.bucket_width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_start(&self, bucket: usize) -> usize {
        self.offset + bucket * self.bucket_width
    }
}

/// Fixed partition of the slot array into primary levels and a backyard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    capacity: usize,
    physical_slots: usize,
    levels: Vec<Span>,
    backyard: Span,
}

impl Layout {
    pub fn new(capacity: usize, config: FunnelConfig) -> Result<Self> {
        if capacity == 0 {
            return Err(FunnelError::InvalidCapacity);
        }

        let reserve_fraction = sanitize_reserve_fraction(config.reserve_fraction);
        let level_count = compute_level_count(reserve_fraction);
        let bucket_width = compute_bucket_width(reserve_fraction);
        let physical_target =
            ((capacity as f64 / (1.0 - reserve_fraction)).ceil() as usize).max(capacity);

        let (mut primary_slots, mut backyard_slots) =
            split_reserve(physical_target, reserve_fraction, bucket_width);
        while backyard_slots < BACKYARD_BUCKET_WIDTH && primary_slots >= bucket_width {
            primary_slots -= bucket_width;
            backyard_slots += bucket_width;
        }

        let backyard = if backyard_slots < 2 * BACKYARD_BUCKET_WIDTH {
            Span {
                offset: primary_slots,
                bucket_count: 1,
                bucket_width: backyard_slots,
            }
        } else {
            Span {
                offset: primary_slots,
                bucket_count: backyard_slots.div_ceil(BACKYARD_BUCKET_WIDTH),
                bucket_width: BACKYARD_BUCKET_WIDTH,
            }
        };

        let mut offset = 0;
        let levels = partition_funnel_buckets(primary_slots / bucket_width, level_count)
            .into_iter()
            .filter(|&bucket_count| bucket_count > 0)
            .map(|bucket_count| {
                let span = Span {
                    offset,
                    bucket_count,
                    bucket_width,
                };
                offset += span.len();
                span
            })
            .collect::<Vec<_>>();

        let layout = Self {
            capacity,
            physical_slots: primary_slots + backyard.len(),
            levels,
            backyard,
        };

        debug!(
            capacity,
            physical_slots = layout.physical_slots,
            levels = layout.levels.len(),
            bucket_width,
            backyard_slots = layout.backyard.len(),
            backyard_buckets = layout.backyard.bucket_count,
            scan_budget = layout.scan_budget(),
            "built funnel layout"
        );

        Ok(layout)
    }

    /// Maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots backing the layout. Always larger than the capacity.
    pub fn physical_slots(&self) -> usize {
        self.physical_slots
    }

    pub fn levels(&self) -> &[Span] {
        &self.levels
    }

    pub fn backyard(&self) -> Span {
        self.backyard
    }

    /// Number of backyard buckets a key may use: one or two.
    pub fn backyard_choices(&self) -> usize {
        self.backyard.bucket_count.min(2)
    }

    /// Upper bound on the slots any single operation inspects.
    pub fn scan_budget(&self) -> usize {
        self.levels.iter().map(|level| level.bucket_width).sum::<usize>()
            + self.backyard_choices() * self.backyard.bucket_width
    }

    /// The ordered buckets a key with `key_hash` may occupy.
    pub fn candidates(&self, key_hash: u64) -> Candidates<'_> {
        Candidates {
            layout: self,
            key_hash,
            position: 0,
        }
    }
}

/// Where a candidate bucket lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Level(usize),
    /// First (`0`) or second (`1`) double-hashing choice.
    Backyard(usize),
}

/// One bucket of a key's candidate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub region: Region,
    pub bucket: usize,
    pub start: usize,
    pub width: usize,
}

impl Candidate {
    /// Slot indices covered by this bucket, in scan order.
    pub fn slots(&self) -> Range<usize> {
        self.start..self.start + self.width
    }
}

/// Iterator over a key's candidate buckets: one per primary level, then up to
/// two backyard buckets.
#[derive(Debug, Clone)]
pub struct Candidates<'a> {
    layout: &'a Layout,
    key_hash: u64,
    position: usize,
}

impl Iterator for Candidates<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        let levels = &self.layout.levels;
        if let Some(level) = levels.get(self.position) {
            let level_idx = self.position;
            self.position += 1;
            let bucket = level_bucket_index(self.key_hash, level_idx, level.bucket_count);
            return Some(Candidate {
                region: Region::Level(level_idx),
                bucket,
                start: level.bucket_start(bucket),
                width: level.bucket_width,
            });
        }

        let choice = self.position - levels.len();
        if choice >= self.layout.backyard_choices() {
            return None;
        }
        self.position += 1;

        let backyard = &self.layout.backyard;
        let first = backyard_first_bucket(self.key_hash, backyard.bucket_count);
        let bucket = if choice == 0 {
            first
        } else {
            backyard_second_bucket(self.key_hash, first, backyard.bucket_count)
        };

        Some(Candidate {
            region: Region::Backyard(choice),
            bucket,
            start: backyard.bucket_start(bucket),
            width: backyard.bucket_width,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let total = self.layout.levels.len() + self.layout.backyard_choices();
        let remaining = total.saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Candidates<'_> {}

impl FusedIterator for Candidates<'_> {}

fn level_bucket_index(key_hash: u64, level_idx: usize, bucket_count: usize) -> usize {
    let salt = (level_idx as u64 + 1).wrapping_mul(LEVEL_SALT);
    (mix64(key_hash.wrapping_add(salt)) % bucket_count as u64) as usize
}

fn backyard_first_bucket(key_hash: u64, bucket_count: usize) -> usize {
    (mix64(key_hash ^ BACKYARD_SALT_FIRST) % bucket_count as u64) as usize
}

// Non-zero step modulo the bucket count, so the two choices never coincide.
fn backyard_second_bucket(key_hash: u64, first: usize, bucket_count: usize) -> usize {
    let step = 1 + (mix64(key_hash ^ BACKYARD_SALT_STEP) % (bucket_count as u64 - 1)) as usize;
    (first + step) % bucket_count
}

fn compute_level_count(reserve_fraction: f64) -> usize {
    (4.0 * (1.0 / reserve_fraction).log2() + 10.0)
        .ceil()
        .max(1.0) as usize
}

fn compute_bucket_width(reserve_fraction: f64) -> usize {
    (2.0 * (1.0 / reserve_fraction).log2()).ceil().max(1.0) as usize
}

/// Splits the physical slots into a primary region of whole buckets and a
/// backyard holding about three quarters of the reserve `δP`.
fn split_reserve(physical: usize, reserve_fraction: f64, bucket_width: usize) -> (usize, usize) {
    let backyard_target = (0.75 * reserve_fraction * physical as f64).ceil() as usize;
    let primary = physical.saturating_sub(backyard_target) / bucket_width * bucket_width;
    (primary, physical - primary)
}

/// Splits `total_buckets` over `level_count` levels so that every level has
/// 3/4 of the previous level's buckets, give or take one.
fn partition_funnel_buckets(total_buckets: usize, level_count: usize) -> Vec<usize> {
    if level_count == 0 {
        return Vec::new();
    }

    // First term of a 3/4 geometric series over `level_count` terms.
    let series = 1.0 - 0.75f64.powi(level_count as i32);
    let estimate = ((0.25 * total_buckets as f64) / series).round() as usize;
    let estimate = estimate.min(total_buckets);

    let mut nearest_first = (0..=total_buckets).flat_map(|offset| {
        let below = estimate.checked_sub(offset);
        let above = (offset > 0)
            .then(|| estimate + offset)
            .filter(|&first| first <= total_buckets);
        below.into_iter().chain(above)
    });

    nearest_first
        .find_map(|first| shrink_from(first, total_buckets, level_count))
        .unwrap_or_else(|| {
            let mut counts = vec![0; level_count];
            counts[0] = total_buckets;
            counts
        })
}

/// Builds the levels below a first level of `first` buckets, keeping each as
/// close to 3/4 of the one above as the remaining total allows.
fn shrink_from(first: usize, total_buckets: usize, level_count: usize) -> Option<Vec<usize>> {
    let mut counts = Vec::with_capacity(level_count);
    counts.push(first);
    let mut left = total_buckets.checked_sub(first)?;

    for later in (0..level_count - 1).rev() {
        let above = counts[counts.len() - 1];
        let (low, high) = next_level_bounds(above);
        let target = (3 * above + 2) / 4;
        let next = (low..=high.min(left))
            .filter(|&count| reachable_below(count, later).contains(&(left - count)))
            .min_by_key(|&count| count.abs_diff(target))?;
        counts.push(next);
        left -= next;
    }

    (left == 0).then_some(counts)
}

/// Bucket counts allowed for the level after one with `current` buckets.
/// An empty level can only be followed by another empty level.
fn next_level_bounds(current: usize) -> (usize, usize) {
    if current == 0 {
        return (0, 0);
    }
    let scaled = current.saturating_mul(3);
    (scaled.saturating_sub(4).div_ceil(4), scaled.saturating_add(4) / 4)
}

/// Totals that `later` levels under a level of `count` buckets can sum to.
fn reachable_below(count: usize, later: usize) -> RangeInclusive<usize> {
    let (mut smallest, mut largest) = (count, count);
    let (mut low_sum, mut high_sum) = (0, 0);
    for _ in 0..later {
        smallest = next_level_bounds(smallest).0;
        largest = next_level_bounds(largest).1;
        low_sum += smallest;
        high_sum += largest;
    }
    low_sum..=high_sum
}
