//! Redistribution plans: precomputed routing between two partition layouts.
//!
//! Building a plan is the expensive, collective step: every participant
//! gathers the others' ownership metadata, then derives locally which of its
//! source values each peer needs and which peer supplies each of its
//! destination slots. Applying a plan moves values only.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::algs::collective::all_gather_bytes;
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{WireCount, WireRange, cast_slice, cast_slice_from};
use crate::layout::{IndexLayout, LayoutId};
use crate::redistribute::combine::{AddCombine, Combine, CombineMode, InsertCombine, MissingPolicy};
use crate::redistribute::exchange::exchange_values;
use crate::vector_error::DistVectorError;

/// Routing from a source partition to a destination partition.
///
/// A plan is valid while both layout identities are unchanged; vectors cache
/// one plan keyed by the `(source, destination)` [`LayoutId`] pair and rebuild
/// it when either layout is replaced.
#[derive(Debug, Clone)]
pub struct RedistributionPlan {
    src_id: LayoutId,
    dst_id: LayoutId,
    rank: usize,
    n_ranks: usize,
    src_local_len: usize,
    dst_local_len: usize,
    /// Per peer (ascending): source-local offsets to pack and send.
    sends: Vec<(usize, Vec<usize>)>,
    /// Per peer (ascending): destination-local offsets, in the peer's send order.
    recvs: Vec<(usize, Vec<usize>)>,
    /// Rank-local `(src_offset, dst_offset)` moves.
    local_moves: Vec<(usize, usize)>,
    /// Destination offsets with no source owner (ZeroFill policy only).
    zero_fill: Vec<usize>,
}

/// First rank whose gathered range table contains `g`. Ownership is unique by
/// the layout invariant, so first match is the owner.
pub(crate) fn owner_in_range_tables(tables: &[Vec<(u64, u64)>], g: u64) -> Option<usize> {
    tables.iter().position(|ranges| {
        let i = ranges.partition_point(|&(_, end)| end <= g);
        ranges.get(i).is_some_and(|&(start, end)| (start..end).contains(&g))
    })
}

fn encode_range_tables(src: &IndexLayout, dst: &IndexLayout) -> Result<Vec<u8>, DistVectorError> {
    let src_ranges: Vec<WireRange> = src.ranges().iter().map(|&(s, e)| WireRange::new(s, e)).collect();
    let dst_ranges: Vec<WireRange> = dst.ranges().iter().map(|&(s, e)| WireRange::new(s, e)).collect();
    let mut payload = Vec::with_capacity(
        2 * std::mem::size_of::<WireCount>()
            + (src_ranges.len() + dst_ranges.len()) * std::mem::size_of::<WireRange>(),
    );
    payload.extend_from_slice(cast_slice(&[
        WireCount::try_new(src_ranges.len())?,
        WireCount::try_new(dst_ranges.len())?,
    ]));
    payload.extend_from_slice(cast_slice(&src_ranges));
    payload.extend_from_slice(cast_slice(&dst_ranges));
    Ok(payload)
}

fn decode_range_tables(
    peer: usize,
    bytes: &[u8],
) -> Result<(Vec<(u64, u64)>, Vec<(u64, u64)>), DistVectorError> {
    let hdr_len = 2 * std::mem::size_of::<WireCount>();
    if bytes.len() < hdr_len {
        return Err(DistVectorError::comm(
            peer,
            format!("range table header truncated ({} bytes)", bytes.len()),
        ));
    }
    let counts: &[WireCount] = cast_slice_from(&bytes[..hdr_len]);
    let (n_src, n_dst) = (counts[0].get(), counts[1].get());
    let body = &bytes[hdr_len..];
    let expected = (n_src + n_dst) * std::mem::size_of::<WireRange>();
    if body.len() != expected {
        return Err(DistVectorError::comm(
            peer,
            format!("range table body has {} bytes, expected {expected}", body.len()),
        ));
    }
    let ranges: &[WireRange] = cast_slice_from(body);
    let src = ranges[..n_src].iter().map(|r| (r.start(), r.end())).collect();
    let dst = ranges[n_src..].iter().map(|r| (r.start(), r.end())).collect();
    Ok((src, dst))
}

impl RedistributionPlan {
    /// Build the routing from `src` to `dst`. Collective: gathers every
    /// participant's source and destination range tables, then derives the
    /// send/receive offset lists locally. Deterministic: peers ascending,
    /// offsets ascending by global index on both sides.
    pub fn build<C: Communicator>(
        dst: &IndexLayout,
        src: &IndexLayout,
        comm: &C,
        tag: CommTag,
        missing: MissingPolicy,
    ) -> Result<Self, DistVectorError> {
        if dst.global_len() != src.global_len() {
            return Err(DistVectorError::DimensionMismatch {
                expected: dst.global_len(),
                found: src.global_len(),
            });
        }
        let me = comm.rank();
        let n_ranks = comm.size();

        let gathered = all_gather_bytes(comm, tag, &encode_range_tables(src, dst)?)?;
        let mut src_tables = Vec::with_capacity(n_ranks);
        let mut dst_tables = Vec::with_capacity(n_ranks);
        for (peer, bytes) in gathered.iter().enumerate() {
            let (s, d) = decode_range_tables(peer, bytes)?;
            src_tables.push(s);
            dst_tables.push(d);
        }

        // Cross-rank sanity: unique ownership means the source ranges tile at
        // most the whole global range.
        let src_total: u64 = src_tables
            .iter()
            .flatten()
            .map(|&(s, e)| e - s)
            .sum();
        if src_total > src.global_len() {
            return Err(DistVectorError::InvalidLayout(format!(
                "source partition owns {src_total} indices for a global size of {}",
                src.global_len()
            )));
        }

        // Receive side: who supplies each of my destination slots.
        let mut recvs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut local_moves = Vec::new();
        let mut zero_fill = Vec::new();
        for (dst_off, g) in dst.owned_indices().enumerate() {
            match owner_in_range_tables(&src_tables, g) {
                Some(r) if r == me => {
                    // unwrap-free: owner tables say we own g
                    let src_off = src.local_offset_of(g).ok_or_else(|| {
                        DistVectorError::InvalidLayout(format!(
                            "gathered table claims rank {me} owns index {g}, local layout disagrees"
                        ))
                    })?;
                    local_moves.push((src_off, dst_off));
                }
                Some(r) => recvs.entry(r).or_default().push(dst_off),
                None => match missing {
                    MissingPolicy::Error => return Err(DistVectorError::UnownedIndex(g)),
                    MissingPolicy::ZeroFill => zero_fill.push(dst_off),
                },
            }
        }

        // Send side: which of my source values each peer's destination needs.
        // Merge walk over my ascending source ranges and the peer's ascending
        // destination ranges; offsets come out ascending by global index,
        // matching the peer's receive order.
        let mut sends: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (peer, peer_dst) in dst_tables.iter().enumerate() {
            if peer == me {
                continue;
            }
            let mut out = Vec::new();
            for &(ds, de) in peer_dst {
                for &(ss, se) in src.ranges() {
                    let lo = ds.max(ss);
                    let hi = de.min(se);
                    for g in lo..hi {
                        // Skip indices a lower rank would supply instead.
                        if owner_in_range_tables(&src_tables, g) == Some(me) {
                            if let Some(off) = src.local_offset_of(g) {
                                out.push(off);
                            }
                        }
                    }
                }
            }
            if !out.is_empty() {
                sends.insert(peer, out);
            }
        }

        let plan = Self {
            src_id: src.id(),
            dst_id: dst.id(),
            rank: me,
            n_ranks,
            src_local_len: src.local_len(),
            dst_local_len: dst.local_len(),
            sends: sends.into_iter().collect(),
            recvs: recvs.into_iter().collect(),
            local_moves,
            zero_fill,
        };
        debug!(
            "built redistribution plan rank {me}: {} local moves, {} send peers, {} recv peers",
            plan.local_moves.len(),
            plan.sends.len(),
            plan.recvs.len()
        );
        Ok(plan)
    }

    #[inline]
    pub fn src_id(&self) -> LayoutId {
        self.src_id
    }

    #[inline]
    pub fn dst_id(&self) -> LayoutId {
        self.dst_id
    }

    /// Compare the routing itself, ignoring layout identities. Two plans
    /// built from equal layouts are routing-equal even though their cache
    /// keys differ.
    pub fn routing_eq(&self, other: &RedistributionPlan) -> bool {
        self.n_ranks == other.n_ranks
            && self.sends == other.sends
            && self.recvs == other.recvs
            && self.local_moves == other.local_moves
            && self.zero_fill == other.zero_fill
    }

    /// Move values from `src_values` into `dst_values` under `mode`.
    ///
    /// Collective: every participant holding a plan from the same build must
    /// call this in the same relative order. Slots not covered by the plan
    /// are left unmodified. Incoming contributions fuse in ascending source-
    /// rank order (rank-local moves at this rank's position), so `Insert` is
    /// deterministic and `Add` is order-independent up to FP rounding.
    pub fn apply<V, C>(
        &self,
        src_values: &[V],
        dst_values: &mut [V],
        comm: &C,
        tag: CommTag,
        mode: CombineMode,
    ) -> Result<(), DistVectorError>
    where
        V: bytemuck::Pod + std::ops::AddAssign + num_traits::Zero,
        C: Communicator,
    {
        mode.ensure_supported()?;
        if src_values.len() != self.src_local_len
            || dst_values.len() != self.dst_local_len
            || comm.size() != self.n_ranks
        {
            return Err(DistVectorError::PlanLayoutMismatch);
        }
        #[cfg(feature = "check-invariants")]
        {
            let src_ok = self
                .sends
                .iter()
                .flat_map(|(_, offs)| offs)
                .chain(self.local_moves.iter().map(|(s, _)| s))
                .all(|&o| o < self.src_local_len);
            let dst_ok = self
                .recvs
                .iter()
                .flat_map(|(_, offs)| offs)
                .chain(self.local_moves.iter().map(|(_, d)| d))
                .chain(self.zero_fill.iter())
                .all(|&o| o < self.dst_local_len);
            if !src_ok || !dst_ok {
                return Err(DistVectorError::PlanLayoutMismatch);
            }
        }
        trace!(
            "apply plan rank {}: mode {mode:?}, {} values out, {} values in",
            comm.rank(),
            self.sends.iter().map(|(_, v)| v.len()).sum::<usize>(),
            self.recvs.iter().map(|(_, v)| v.len()).sum::<usize>(),
        );

        let received = exchange_values(comm, tag, src_values, &self.sends, &self.recvs)?;

        match mode {
            CombineMode::Insert => self.fuse::<V, InsertCombine>(src_values, dst_values, &received),
            CombineMode::Add => self.fuse::<V, AddCombine>(src_values, dst_values, &received),
            // ensure_supported() has already rejected these.
            CombineMode::Min | CombineMode::Max => unreachable!("unsupported mode past gate"),
        }

        if mode == CombineMode::Insert {
            for &off in &self.zero_fill {
                dst_values[off] = V::zero();
            }
        }
        Ok(())
    }

    fn fuse<V, F>(&self, src_values: &[V], dst_values: &mut [V], received: &[(usize, Vec<V>)])
    where
        V: Copy,
        F: Combine<V>,
    {
        // `received` and `self.recvs` are both ascending by peer and pairwise
        // aligned; walk them together, slotting local moves at our own rank.
        debug_assert_eq!(received.len(), self.recvs.len());
        let mut incoming = self.recvs.iter().zip(received.iter()).peekable();
        for rank in 0..self.n_ranks {
            if rank == self.rank {
                for &(src_off, dst_off) in &self.local_moves {
                    F::fuse(&mut dst_values[dst_off], src_values[src_off]);
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
