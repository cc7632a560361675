//! `IndexLayout`: the partition descriptor for a distributed vector.
//!
//! A layout records which global indices this participant owns, as an ordered
//! list of ascending, non-overlapping half-open ranges, together with the
//! global size of the vector and this participant's rank. Across the whole
//! computation every global index belongs to exactly one participant; a
//! single rank cannot verify that invariant locally, so it is checked where
//! the gathered ownership tables are available (plan construction).
//!
//! Layouts are immutable once constructed and replaced wholesale on resize.
//! Each construction draws a fresh [`LayoutId`], which the redistribution-plan
//! cache uses as its identity key: replacing a layout invalidates every plan
//! derived from it without any explicit bookkeeping.

use itertools::Itertools;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::vector_error::DistVectorError;

/// Opaque identity of one layout construction. Fresh per construction,
/// never reused within a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LayoutId(u64);

static NEXT_LAYOUT_ID: AtomicU64 = AtomicU64::new(1);

impl LayoutId {
    fn fresh() -> Self {
        LayoutId(NEXT_LAYOUT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for LayoutId {
    fn default() -> Self {
        LayoutId::fresh()
    }
}

/// Partition descriptor: the locally owned index ranges of one participant.
///
/// # Invariants
/// - Ranges are ascending, non-empty, non-overlapping and within
///   `0..global_len`.
/// - `local_len` equals the sum of all range lengths.
/// - `cum[i]` is the local offset of the first index of range `i`.
///
/// Checked at construction; can be re-verified manually via
/// [`validate_invariants`](Self::validate_invariants).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct IndexLayout {
    /// Half-open `[start, end)` ranges of owned global indices, ascending.
    ranges: Vec<(u64, u64)>,
    /// Cumulative local offsets, one per range.
    cum: Vec<usize>,
    global_len: u64,
    local_len: usize,
    rank: usize,
    /// Identity for plan caching. Not serialized; a deserialized layout is a
    /// new construction and gets a fresh id.
    #[serde(skip, default)]
    id: LayoutId,
}

impl IndexLayout {
    /// Layout owning the single contiguous block `start..end`.
    pub fn contiguous(
        start: u64,
        end: u64,
        global_len: u64,
        rank: usize,
    ) -> Result<Self, DistVectorError> {
        if start == end {
            return Self::empty(global_len, rank);
        }
        Self::from_ranges(vec![(start, end)], global_len, rank)
    }

    /// Layout owning nothing (a participant with no local elements).
    pub fn empty(global_len: u64, rank: usize) -> Result<Self, DistVectorError> {
        Self::from_ranges(Vec::new(), global_len, rank)
    }

    /// Layout from an explicit range list. Ranges must be ascending,
    /// non-empty, non-overlapping and within bounds.
    pub fn from_ranges(
        ranges: Vec<(u64, u64)>,
        global_len: u64,
        rank: usize,
    ) -> Result<Self, DistVectorError> {
        let mut cum = Vec::with_capacity(ranges.len());
        let mut local_len = 0usize;
        for &(start, end) in &ranges {
            cum.push(local_len);
            if start >= end {
                return Err(DistVectorError::InvalidLayout(format!(
                    "empty or descending range [{start}, {end})"
                )));
            }
            local_len += (end - start) as usize;
        }
        let layout = Self {
            ranges,
            cum,
            global_len,
            local_len,
            rank,
            id: LayoutId::fresh(),
        };
        layout.validate_invariants()?;
        Ok(layout)
    }

    /// Layout from a scattered list of owned indices; runs of consecutive
    /// indices are coalesced into ranges. Duplicates are rejected.
    pub fn from_indices(
        mut indices: Vec<u64>,
        global_len: u64,
        rank: usize,
    ) -> Result<Self, DistVectorError> {
        indices.sort_unstable();
        if let Some(dup) = indices.windows(2).find(|w| w[0] == w[1]) {
            return Err(DistVectorError::InvalidLayout(format!(
                "duplicate owned index {}",
                dup[0]
            )));
        }
        let ranges: Vec<(u64, u64)> = indices
            .into_iter()
            .map(|i| (i, i + 1))
            .coalesce(|a, b| {
                if a.1 == b.0 {
                    Ok((a.0, b.1))
                } else {
                    Err((a, b))
                }
            })
            .collect();
        Self::from_ranges(ranges, global_len, rank)
    }

    /// Even block partition of `0..global_len` over `n_ranks` participants;
    /// the first `global_len % n_ranks` ranks get one extra index.
    pub fn block_partition(
        global_len: u64,
        rank: usize,
        n_ranks: usize,
    ) -> Result<Self, DistVectorError> {
        if n_ranks == 0 || rank >= n_ranks {
            return Err(DistVectorError::InvalidLayout(format!(
                "rank {rank} out of range for {n_ranks} participants"
            )));
        }
        let n = n_ranks as u64;
        let base = global_len / n;
        let extra = global_len % n;
        let r = rank as u64;
        let start = r * base + r.min(extra);
        let len = base + u64::from(r < extra);
        Self::contiguous(start, start + len, global_len, rank)
    }

    #[inline]
    pub fn id(&self) -> LayoutId {
        self.id
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Global size of the distributed vector this layout partitions.
    #[inline]
    pub fn global_len(&self) -> u64 {
        self.global_len
    }

    /// Number of locally owned indices.
    #[inline]
    pub fn local_len(&self) -> usize {
        self.local_len
    }

    /// True iff the local ownership is a single contiguous block (or empty).
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.ranges.len() <= 1
    }

    /// Owned ranges in ascending order.
    #[inline]
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// True iff global index `g` is owned locally.
    #[inline]
    pub fn contains(&self, g: u64) -> bool {
        self.local_offset_of(g).is_some()
    }

    /// Local buffer offset of global index `g`, if owned. O(log #ranges).
    pub fn local_offset_of(&self, g: u64) -> Option<usize> {
        let i = self.ranges.partition_point(|&(_, end)| end <= g);
        let &(start, end) = self.ranges.get(i)?;
        (start..end)
            .contains(&g)
            .then(|| self.cum[i] + (g - start) as usize)
    }

    /// Global index stored at `local` in the local buffer, if in range.
    pub fn global_index_of(&self, local: usize) -> Option<u64> {
        if local >= self.local_len {
            return None;
        }
        let i = self
            .cum
            .partition_point(|&c| c <= local)
            .saturating_sub(1);
        let (start, _) = self.ranges[i];
        Some(start + (local - self.cum[i]) as u64)
    }

    /// Iterator over the owned global indices, ascending.
    pub fn owned_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(s, e)| s..e)
    }

    /// Partition equality: true iff both layouts partition the same global
    /// range and own exactly the same local indices. O(#ranges); never
    /// communicates. Under the SPMD contract (all participants construct
    /// their layouts from the same global partition) the verdict is
    /// collective-consistent, so it gates the redistribution path safely.
    pub fn same_layout_as(&self, other: &IndexLayout) -> bool {
        self.global_len == other.global_len && self.ranges == other.ranges
    }

    /// Validate the construction invariants.
    pub fn validate_invariants(&self) -> Result<(), DistVectorError> {
        let mut prev_end = 0u64;
        let mut sum = 0usize;
        for (i, &(start, end)) in self.ranges.iter().enumerate() {
            if start >= end {
                return Err(DistVectorError::InvalidLayout(format!(
                    "empty or descending range [{start}, {end})"
                )));
            }
            if i > 0 && start < prev_end {
                return Err(DistVectorError::InvalidLayout(format!(
                    "range [{start}, {end}) overlaps or precedes [.., {prev_end})"
                )));
            }
            if end > self.global_len {
                return Err(DistVectorError::InvalidLayout(format!(
                    "range [{start}, {end}) exceeds global size {}",
                    self.global_len
                )));
            }
            if self.cum[i] != sum {
                return Err(DistVectorError::InvalidLayout(format!(
                    "cumulative offset {} for range {i}, expected {sum}",
                    self.cum[i]
                )));
            }
            prev_end = end;
            sum += (end - start) as usize;
        }
        if sum != self.local_len {
            return Err(DistVectorError::InvalidLayout(format!(
                "local length {} does not match range sum {sum}",
                self.local_len
            )));
        }
        Ok(())
    }
}
