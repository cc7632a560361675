//! Sparse import: route externally supplied `(index, value)` pairs to their
//! owning participants.
//!
//! An [`ImportPlan`] is the sparse analogue of a redistribution plan: the
//! stored indices play the role of the source partition, and each stored
//! element is shipped to whichever participant owns its global index in the
//! destination layout. Vectors cache one plan keyed by the stored index set
//! and the destination layout identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::algs::collective::all_gather_bytes;
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{WireCount, WireIndex, WireRange, cast_slice, cast_slice_from};
use crate::layout::{IndexLayout, LayoutId};
use crate::redistribute::combine::{AddCombine, Combine, CombineMode, InsertCombine};
use crate::redistribute::exchange::exchange_values;
use crate::redistribute::plan::{RedistributionPlan, owner_in_range_tables};
use crate::vector::{DistVector, Scalar, TAG_IMPORT_APPLY, TAG_IMPORT_BUILD};
use crate::vector_error::DistVectorError;

/// A sparse set of `(global index, value)` pairs to fold into a vector.
///
/// Indices may reference any participant's slots and may repeat; repeated
/// indices accumulate under `Add` and resolve deterministically under
/// `Insert` (later stored positions of higher ranks win).
#[derive(Debug, Clone)]
pub struct SparseImport<V> {
    indices: Vec<u64>,
    values: Vec<V>,
}

impl<V> SparseImport<V> {
    /// Pair up indices and values; both slices must have the same length.
    pub fn new(indices: Vec<u64>, values: Vec<V>) -> Result<Self, DistVectorError> {
        if indices.len() != values.len() {
            return Err(DistVectorError::ImportLengthMismatch {
                indices: indices.len(),
                values: values.len(),
            });
        }
        Ok(Self { indices, values })
    }

    #[inline]
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    #[inline]
    pub fn values(&self) -> &[V] {
        &self.values
    }

    /// Number of stored pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Routing from locally stored sparse pairs to their owners in a destination
/// partition.
#[derive(Debug, Clone)]
pub struct ImportPlan {
    dst_id: LayoutId,
    rank: usize,
    n_ranks: usize,
    n_stored: usize,
    dst_local_len: usize,
    /// Per peer (ascending): stored positions to pack and send.
    sends: Vec<(usize, Vec<usize>)>,
    /// Per peer (ascending): destination-local offsets, in the peer's stored
    /// order.
    recvs: Vec<(usize, Vec<usize>)>,
    /// Rank-local `(stored_pos, dst_offset)` moves.
    local_moves: Vec<(usize, usize)>,
}

fn encode_import_tables(dst: &IndexLayout, stored: &[u64]) -> Result<Vec<u8>, DistVectorError> {
    let ranges: Vec<WireRange> = dst.ranges().iter().map(|&(s, e)| WireRange::new(s, e)).collect();
    let indices: Vec<WireIndex> = stored.iter().map(|&g| WireIndex::of(g)).collect();
    let mut payload = Vec::with_capacity(
        2 * std::mem::size_of::<WireCount>()
            + ranges.len() * std::mem::size_of::<WireRange>()
            + indices.len() * std::mem::size_of::<WireIndex>(),
    );
    payload.extend_from_slice(cast_slice(&[
        WireCount::try_new(ranges.len())?,
        WireCount::try_new(indices.len())?,
    ]));
    payload.extend_from_slice(cast_slice(&ranges));
    payload.extend_from_slice(cast_slice(&indices));
    Ok(payload)
}

fn decode_import_tables(
    peer: usize,
    bytes: &[u8],
) -> Result<(Vec<(u64, u64)>, Vec<u64>), DistVectorError> {
    let hdr_len = 2 * std::mem::size_of::<WireCount>();
    if bytes.len() < hdr_len {
        return Err(DistVectorError::comm(
            peer,
            format!("import table header truncated ({} bytes)", bytes.len()),
        ));
    }
    let counts: &[WireCount] = cast_slice_from(&bytes[..hdr_len]);
    let (n_ranges, n_stored) = (counts[0].get(), counts[1].get());
    let ranges_len = n_ranges * std::mem::size_of::<WireRange>();
    let body = &bytes[hdr_len..];
    let expected = ranges_len + n_stored * std::mem::size_of::<WireIndex>();
    if body.len() != expected {
        return Err(DistVectorError::comm(
            peer,
            format!("import table body has {} bytes, expected {expected}", body.len()),
        ));
    }
    let ranges: &[WireRange] = cast_slice_from(&body[..ranges_len]);
    let indices: &[WireIndex] = cast_slice_from(&body[ranges_len..]);
    Ok((
        ranges.iter().map(|r| (r.start(), r.end())).collect(),
        indices.iter().map(|i| i.get()).collect(),
    ))
}

impl ImportPlan {
    /// Build the routing for `stored` into `dst`. Collective: gathers every
    /// participant's destination ranges and stored index list, then derives
    /// send/receive lists locally. Every stored index must be globally valid
    /// and owned by some participant in `dst`.
    pub fn build<C: Communicator>(
        dst: &IndexLayout,
        stored: &[u64],
        comm: &C,
        tag: CommTag,
    ) -> Result<Self, DistVectorError> {
        for &g in stored {
            if g >= dst.global_len() {
                return Err(DistVectorError::IndexOutOfRange {
                    index: g,
                    global_len: dst.global_len(),
                });
            }
        }
        let me = comm.rank();
        let n_ranks = comm.size();

        let gathered = all_gather_bytes(comm, tag, &encode_import_tables(dst, stored)?)?;
        let mut dst_tables = Vec::with_capacity(n_ranks);
        let mut stored_tables = Vec::with_capacity(n_ranks);
        for (peer, bytes) in gathered.iter().enumerate() {
            let (ranges, indices) = decode_import_tables(peer, bytes)?;
            dst_tables.push(ranges);
            stored_tables.push(indices);
        }

        // Send side: route each of my stored positions to its owner.
        let mut sends: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut local_moves = Vec::new();
        for (pos, &g) in stored.iter().enumerate() {
            match owner_in_range_tables(&dst_tables, g) {
                Some(r) if r == me => {
                    let off = dst.local_offset_of(g).ok_or_else(|| {
                        DistVectorError::InvalidLayout(format!(
                            "gathered table claims rank {me} owns index {g}, local layout disagrees"
                        ))
                    })?;
                    local_moves.push((pos, off));
                }
                Some(r) => sends.entry(r).or_default().push(pos),
                None => return Err(DistVectorError::UnownedIndex(g)),
            }
        }

        // Receive side: walk each peer's stored list in its order, picking
        // the indices I own. This is exactly the peer's send order for me.
        let mut recvs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (peer, peer_stored) in stored_tables.iter().enumerate() {
            if peer == me {
                continue;
            }
            let mut offs = Vec::new();
            for &g in peer_stored {
                if owner_in_range_tables(&dst_tables, g) == Some(me) {
                    if let Some(off) = dst.local_offset_of(g) {
                        offs.push(off);
                    }
                }
            }
            if !offs.is_empty() {
                recvs.insert(peer, offs);
            }
        }

        let plan = Self {
            dst_id: dst.id(),
            rank: me,
            n_ranks,
            n_stored: stored.len(),
            dst_local_len: dst.local_len(),
            sends: sends.into_iter().collect(),
            recvs: recvs.into_iter().collect(),
            local_moves,
        };
        debug!(
            "built import plan rank {me}: {} stored, {} local moves, {} send peers, {} recv peers",
            plan.n_stored,
            plan.local_moves.len(),
            plan.sends.len(),
            plan.recvs.len()
        );
        Ok(plan)
    }

    #[inline]
    pub fn dst_id(&self) -> LayoutId {
        self.dst_id
    }

    /// Number of stored pairs this plan was built for.
    #[inline]
    pub fn stored_len(&self) -> usize {
        self.n_stored
    }

    /// Fold `src`'s values into `dst_values` under `mode`.
    ///
    /// Collective; same ordering contract as a redistribution apply. Slots no
    /// stored index maps to are left unmodified under both modes.
    pub fn apply<V, C>(
        &self,
        src: &SparseImport<V>,
        dst_values: &mut [V],
        comm: &C,
        tag: CommTag,
        mode: CombineMode,
    ) -> Result<(), DistVectorError>
    where
        V: bytemuck::Pod + std::ops::AddAssign,
        C: Communicator,
    {
        mode.ensure_supported()?;
        if src.len() != self.n_stored
            || dst_values.len() != self.dst_local_len
            || comm.size() != self.n_ranks
        {
            return Err(DistVectorError::PlanLayoutMismatch);
        }
        trace!(
            "apply import plan rank {}: mode {mode:?}, {} values out, {} values in",
            comm.rank(),
            self.sends.iter().map(|(_, v)| v.len()).sum::<usize>(),
            self.recvs.iter().map(|(_, v)| v.len()).sum::<usize>(),
        );

        let received = exchange_values(comm, tag, src.values(), &self.sends, &self.recvs)?;

        match mode {
            CombineMode::Insert => self.fuse::<V, InsertCombine>(src.values(), dst_values, &received),
            CombineMode::Add => self.fuse::<V, AddCombine>(src.values(), dst_values, &received),
            // ensure_supported() has already rejected these.
            CombineMode::Min | CombineMode::Max => unreachable!("unsupported mode past gate"),
        }
        Ok(())
    }

    fn fuse<V, F>(&self, stored_values: &[V], dst_values: &mut [V], received: &[(usize, Vec<V>)])
    where
        V: Copy,
        F: Combine<V>,
    {
        debug_assert_eq!(received.len(), self.recvs.len());
        let mut incoming = self.recvs.iter().zip(received.iter()).peekable();
        for rank in 0..self.n_ranks {
            if rank == self.rank {
                for &(pos, dst_off) in &self.local_moves {
                    F::fuse(&mut dst_values[dst_off], stored_values[pos]);
                }
                continue;
            }
            if let Some(((peer, offsets), (recv_peer, values))) = incoming.peek() {
                if *peer == rank {
                    debug_assert_eq!(peer, recv_peer);
                    for (&off, &v) in offsets.iter().zip(values.iter()) {
                        F::fuse(&mut dst_values[off], v);
                    }
                    incoming.next();
                }
            }
        }
    }
}

/// Memoized import plan, keyed by the stored index set and the destination
/// layout identity.
#[derive(Debug, Clone)]
pub(crate) struct CachedImportPlan {
    pub(crate) stored: Vec<u64>,
    pub(crate) dst_id: LayoutId,
    pub(crate) plan: Arc<ImportPlan>,
}

/// An externally held communication pattern, reusable across vectors that
/// share the participating layouts.
#[derive(Debug, Clone)]
pub enum CommPattern {
    Redistribution(Arc<RedistributionPlan>),
    Import(Arc<ImportPlan>),
}

impl CommPattern {
    pub fn kind(&self) -> &'static str {
        match self {
            CommPattern::Redistribution(_) => "redistribution",
            CommPattern::Import(_) => "import",
        }
    }

    /// The import plan inside, or a type-mismatch error for any other kind.
    pub fn as_import(&self) -> Result<&Arc<ImportPlan>, DistVectorError> {
        match self {
            CommPattern::Import(plan) => Ok(plan),
            other => Err(DistVectorError::PatternTypeMismatch {
                expected: "import",
                found: other.kind(),
            }),
        }
    }
}

impl<V: Scalar, C: Communicator> DistVector<V, C> {
    /// Fold the sparse pairs in `src` into this vector under `mode`,
    /// shipping each pair to the participant that owns its index.
    ///
    /// Collective. The routing is cached and reused while the stored index
    /// set and this vector's layout are unchanged. An unsupported mode fails
    /// before any message is posted, leaving the vector untouched.
    pub fn import_from(
        &mut self,
        src: &SparseImport<V>,
        mode: CombineMode,
    ) -> Result<(), DistVectorError> {
        mode.ensure_supported()?;
        let plan = self.import_plan_for(src.indices())?;
        self.apply_import(&plan, src, mode)
    }

    /// Like [`import_from`](Self::import_from), but with a caller-held
    /// pattern instead of the internal cache. Fails with
    /// [`DistVectorError::PatternTypeMismatch`] for a non-import pattern and
    /// with [`DistVectorError::PlanLayoutMismatch`] if the plan was built for
    /// a different destination layout.
    pub fn import_with_pattern(
        &mut self,
        src: &SparseImport<V>,
        mode: CombineMode,
        pattern: &CommPattern,
    ) -> Result<(), DistVectorError> {
        let plan = pattern.as_import()?.clone();
        if plan.dst_id() != self.layout().id() {
            return Err(DistVectorError::PlanLayoutMismatch);
        }
        self.apply_import(&plan, src, mode)
    }

    fn apply_import(
        &mut self,
        plan: &ImportPlan,
        src: &SparseImport<V>,
        mode: CombineMode,
    ) -> Result<(), DistVectorError> {
        let comm = self.comm().clone();
        let mut values = std::mem::take(&mut self.values);
        let result = plan.apply(src, &mut values, comm.as_ref(), TAG_IMPORT_APPLY, mode);
        self.values = values;
        result
    }

    /// Build-or-reuse the import plan for `stored`. Collective on a cache
    /// miss.
    fn import_plan_for(&mut self, stored: &[u64]) -> Result<Arc<ImportPlan>, DistVectorError> {
        let dst_id = self.layout().id();
        if let Some(cached) = &self.import_cache {
            if cached.dst_id == dst_id && cached.stored == stored {
                debug!("import plan cache hit on rank {}", self.comm().rank());
                return Ok(cached.plan.clone());
            }
        }
        debug!(
            "import plan cache miss on rank {}; rebuilding",
            self.comm().rank()
        );
        let plan = Arc::new(ImportPlan::build(
            self.layout(),
            stored,
            self.comm().as_ref(),
            TAG_IMPORT_BUILD,
        )?);
        self.import_cache = Some(CachedImportPlan {
            stored: stored.to_vec(),
            dst_id,
            plan: plan.clone(),
        });
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn vec_of(values: &[f64]) -> DistVector<f64, NoComm> {
        let n = values.len() as u64;
        let layout = Arc::new(IndexLayout::contiguous(0, n, n, 0).unwrap());
        let mut v = DistVector::new(layout, Arc::new(NoComm));
        v.local_values_mut().copy_from_slice(values);
        v
    }

    #[test]
    fn length_mismatch_rejected_at_construction() {
        assert_eq!(
            SparseImport::new(vec![0, 1], vec![1.0]).unwrap_err(),
            DistVectorError::ImportLengthMismatch {
                indices: 2,
                values: 1
            }
        );
    }

    #[test]
    fn insert_overwrites_only_stored_slots() {
        let mut v = vec_of(&[1.0, 2.0, 3.0, 4.0]);
        let imp = SparseImport::new(vec![2, 0], vec![30.0, 10.0]).unwrap();
        v.import_from(&imp, CombineMode::Insert).unwrap();
        assert_eq!(v.local_values(), &[10.0, 2.0, 30.0, 4.0]);
    }

    #[test]
    fn add_accumulates_duplicate_indices() {
        let mut v = vec_of(&[1.0, 1.0]);
        let imp = SparseImport::new(vec![1, 1, 0], vec![2.0, 3.0, 0.5]).unwrap();
        v.import_from(&imp, CombineMode::Add).unwrap();
        assert_eq!(v.local_values(), &[1.5, 6.0]);
    }

    #[test]
    fn repeated_import_reuses_cached_plan() {
        let mut v = vec_of(&[0.0, 0.0, 0.0]);
        let imp = SparseImport::new(vec![1], vec![5.0]).unwrap();
        v.import_from(&imp, CombineMode::Insert).unwrap();
        let cached = v.import_cache.as_ref().unwrap().plan.clone();
        let imp2 = SparseImport::new(vec![1], vec![7.0]).unwrap();
        v.import_from(&imp2, CombineMode::Add).unwrap();
        assert!(Arc::ptr_eq(&v.import_cache.as_ref().unwrap().plan, &cached));
        assert_eq!(v.local_values(), &[0.0, 12.0, 0.0]);
    }

    #[test]
    fn unsupported_mode_leaves_destination_unchanged() {
        let mut v = vec_of(&[1.0, 2.0]);
        let imp = SparseImport::new(vec![0], vec![9.0]).unwrap();
        let err = v.import_from(&imp, CombineMode::Min).unwrap_err();
        assert!(matches!(err, DistVectorError::NotImplemented(_)));
        assert_eq!(v.local_values(), &[1.0, 2.0]);
        assert!(v.import_cache.is_none());
    }

    #[test]
    fn out_of_range_stored_index_rejected() {
        let mut v = vec_of(&[1.0, 2.0]);
        let imp = SparseImport::new(vec![2], vec![9.0]).unwrap();
        assert_eq!(
            v.import_from(&imp, CombineMode::Insert).unwrap_err(),
            DistVectorError::IndexOutOfRange {
                index: 2,
                global_len: 2
            }
        );
    }

    #[test]
    fn pattern_variant_checks_kind_and_layout() {
        let mut v = vec_of(&[1.0, 2.0]);
        let imp = SparseImport::new(vec![1], vec![8.0]).unwrap();

        let plan = Arc::new(
            ImportPlan::build(v.layout(), imp.indices(), &NoComm, TAG_IMPORT_BUILD).unwrap(),
        );
        v.import_with_pattern(&imp, CombineMode::Insert, &CommPattern::Import(plan))
            .unwrap();
        assert_eq!(v.local_values(), &[1.0, 8.0]);

        // Wrong pattern kind.
        let layout = v.layout().clone();
        let redist = Arc::new(
            RedistributionPlan::build(
                &layout,
                &layout,
                &NoComm,
                TAG_IMPORT_BUILD,
                crate::redistribute::combine::MissingPolicy::Error,
            )
            .unwrap(),
        );
        let err = v
            .import_with_pattern(&imp, CombineMode::Insert, &CommPattern::Redistribution(redist))
            .unwrap_err();
        assert_eq!(
            err,
            DistVectorError::PatternTypeMismatch {
                expected: "import",
                found: "redistribution"
            }
        );

        // Right kind, wrong destination layout.
        let other = vec_of(&[0.0, 0.0]);
        let stale = Arc::new(
            ImportPlan::build(other.layout(), imp.indices(), &NoComm, TAG_IMPORT_BUILD).unwrap(),
        );
        let err = v
            .import_with_pattern(&imp, CombineMode::Insert, &CommPattern::Import(stale))
            .unwrap_err();
        assert_eq!(err, DistVectorError::PlanLayoutMismatch);
    }
}
