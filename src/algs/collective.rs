//! Collective exchange helpers built from point-to-point messages.
//!
//! Every participant must invoke these in the same relative order; each call
//! is a blocking exchange that completes before returning. All send/receive
//! handles are drained before returning, even if an error occurs, so a failed
//! collective never leaves stray messages for the next one.

use std::collections::HashMap;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::vector_error::DistVectorError;

/// Gather one byte payload from every rank.
///
/// Returns `size()` payloads indexed by rank; entry `rank()` is a copy of
/// `payload`. Stage 1 (tag) exchanges byte counts, stage 2 (tag+1) the bytes.
pub fn all_gather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    payload: &[u8],
) -> Result<Vec<Vec<u8>>, DistVectorError> {
    let n_ranks = comm.size();
    let me = comm.rank();
    if n_ranks == 1 {
        return Ok(vec![payload.to_vec()]);
    }
    // Validated before any message is posted, so an oversized payload cannot
    // leave peers waiting on a collective we abandoned.
    let count = WireCount::try_new(payload.len())?;

    // --- Stage 1: exchange byte counts with every peer ---
    let size_tag = tag.base();
    let mut recv_size: HashMap<usize, (C::RecvHandle, WireCount)> = HashMap::new();
    for peer in (0..n_ranks).filter(|&p| p != me) {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(peer, size_tag, cast_slice_mut(std::slice::from_mut(&mut cnt)));
        recv_size.insert(peer, (h, cnt));
    }
    let mut pending_sends = Vec::with_capacity(n_ranks.saturating_sub(1));
    for peer in (0..n_ranks).filter(|&p| p != me) {
        pending_sends.push(comm.isend(peer, size_tag, cast_slice(std::slice::from_ref(&count))));
    }

    let mut sizes: HashMap<usize, usize> = HashMap::new();
    let mut maybe_err = None;
    for (peer, (h, mut cnt)) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                sizes.insert(peer, cnt.get());
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    ),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!("failed to receive payload size from rank {peer}"),
                ));
            }
            _ => {} // already have an error; just drain
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }
    if let Some(err) = maybe_err {
        return Err(err);
    }

    // --- Stage 2: exchange the payloads themselves ---
    let data_tag = tag.offset(1).base();
    let mut recv_data: HashMap<usize, (C::RecvHandle, Vec<u8>)> = HashMap::new();
    for peer in (0..n_ranks).filter(|&p| p != me) {
        let mut buf = vec![0u8; sizes[&peer]];
        let h = comm.irecv(peer, data_tag, &mut buf);
        recv_data.insert(peer, (h, buf));
    }
    let mut pending_sends = Vec::with_capacity(n_ranks.saturating_sub(1));
    for peer in (0..n_ranks).filter(|&p| p != me) {
        pending_sends.push(comm.isend(peer, data_tag, payload));
    }

    let mut out = vec![Vec::new(); n_ranks];
    out[me] = payload.to_vec();
    for (peer, (h, buf)) in recv_data {
        match h.wait() {
            Some(data) if data.len() == buf.len() => out[peer] = data,
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!("expected {} payload bytes, got {}", buf.len(), data.len()),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!("failed to receive payload from rank {peer}"),
                ));
            }
            _ => {}
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }
    if let Some(err) = maybe_err {
        return Err(err);
    }
    Ok(out)
}

/// Global reduction by a binary fold over one `Pod` value per rank.
///
/// Folding happens in ascending rank order on every participant, so every
/// rank observes the same result even for non-associative scalar types.
pub fn all_reduce<C, T, F>(comm: &C, tag: CommTag, local: T, fold: F) -> Result<T, DistVectorError>
where
    C: Communicator,
    T: bytemuck::Pod,
    F: Fn(T, T) -> T,
{
    let gathered = all_gather_bytes(comm, tag, cast_slice(std::slice::from_ref(&local)))?;
    let me = comm.rank();
    let mut acc: Option<T> = None;
    for (peer, bytes) in gathered.iter().enumerate() {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(DistVectorError::comm(
                peer,
                format!(
                    "reduction payload from rank {peer} has {} bytes, expected {}",
                    bytes.len(),
                    std::mem::size_of::<T>()
                ),
            ));
        }
        let v = if peer == me {
            local
        } else {
            let mut v = T::zeroed();
            cast_slice_mut(std::slice::from_mut(&mut v)).copy_from_slice(bytes);
            v
        };
        acc = Some(match acc {
            None => v,
            Some(a) => fold(a, v),
        });
    }
    // size() >= 1, so the accumulator is always populated.
    acc.ok_or_else(|| DistVectorError::comm(me, "empty reduction".to_string()))
}

/// Sum of one value per rank.
pub fn all_reduce_sum<C, T>(comm: &C, tag: CommTag, local: T) -> Result<T, DistVectorError>
where
    C: Communicator,
    T: bytemuck::Pod + std::ops::Add<Output = T>,
{
    all_reduce(comm, tag, local, |a, b| a + b)
}

/// Maximum of one value per rank (by `PartialOrd`; NaN-free inputs expected).
pub fn all_reduce_max<C, T>(comm: &C, tag: CommTag, local: T) -> Result<T, DistVectorError>
where
    C: Communicator,
    T: bytemuck::Pod + PartialOrd,
{
    all_reduce(comm, tag, local, |a, b| if b > a { b } else { a })
}
