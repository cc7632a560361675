//! Value exchange for a resolved routing: metadata is already known, so this
//! stage moves values only.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, cast_slice_from};
use crate::vector_error::DistVectorError;

/// Exchange values according to precomputed send/receive offset lists.
///
/// `sends` and `recvs` are `(peer, offsets)` lists, ascending by peer, with
/// offsets into `src_values` (sends) or the caller's destination buffer
/// (recvs). Returns the received values per peer, ascending by peer, in the
/// sender's offset order. All handles are drained before returning, even on
/// error, so a failed exchange cannot poison the next collective.
pub fn exchange_values<V, C>(
    comm: &C,
    tag: CommTag,
    src_values: &[V],
    sends: &[(usize, Vec<usize>)],
    recvs: &[(usize, Vec<usize>)],
) -> Result<Vec<(usize, Vec<V>)>, DistVectorError>
where
    V: bytemuck::Pod,
    C: Communicator,
{
    // Post all receives first.
    let mut pending_recvs = Vec::with_capacity(recvs.len());
    for (peer, offsets) in recvs {
        let mut buf = vec![0u8; offsets.len() * std::mem::size_of::<V>()];
        let h = comm.irecv(*peer, tag.base(), &mut buf);
        pending_recvs.push((*peer, offsets.len(), h, buf));
    }

    // Pack and send; buffers stay alive until the handles are drained.
    let mut send_bufs = Vec::with_capacity(sends.len());
    let mut pending_sends = Vec::with_capacity(sends.len());
    for (peer, offsets) in sends {
        let packed: Vec<V> = offsets.iter().map(|&o| src_values[o]).collect();
        pending_sends.push((*peer, comm.isend(*peer, tag.base(), cast_slice(&packed))));
        send_bufs.push(packed);
    }

    let mut received = Vec::with_capacity(pending_recvs.len());
    let mut maybe_err = None;
    for (peer, n_items, h, buf) in pending_recvs {
        match h.wait() {
            Some(data) if data.len() == buf.len() => {
                let values: &[V] = cast_slice_from(&data);
                received.push((peer, values.to_vec()));
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!(
                        "expected {} value bytes ({n_items} items) from rank {peer}, got {}",
                        buf.len(),
                        data.len()
                    ),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DistVectorError::comm(
                    peer,
                    format!("failed to receive values from rank {peer}"),
                ));
            }
            _ => {} // already failing; just drain
        }
    }
    for (_, send) in pending_sends {
        let _ = send.wait();
    }
    if let Some(err) = maybe_err {
        return Err(err);
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::MailboxComm;
    use serial_test::serial;

    #[test]
    #[serial]
    fn crossed_exchange_two_ranks() {
        MailboxComm::reset();
        let tag = CommTag::new(0x0200);
        let h0 = std::thread::spawn(move || {
            let comm = MailboxComm::new(0, 2);
            let src = [1.0f64, 2.0, 3.0];
            exchange_values(
                &comm,
                tag,
                &src,
                &[(1, vec![2, 0])],
                &[(1, vec![0, 1])],
            )
            .unwrap()
        });
        let h1 = std::thread::spawn(move || {
            let comm = MailboxComm::new(1, 2);
            let src = [10.0f64, 20.0];
            exchange_values(
                &comm,
                tag,
                &src,
                &[(0, vec![1, 0])],
                &[(0, vec![0, 1])],
            )
            .unwrap()
        });
        let got0 = h0.join().unwrap();
        let got1 = h1.join().unwrap();
        // rank 1 sent offsets [1, 0] of [10, 20] -> rank 0 receives [20, 10]
        assert_eq!(got0, vec![(1usize, vec![20.0, 10.0])]);
        // rank 0 sent offsets [2, 0] of [1, 2, 3] -> rank 1 receives [3, 1]
        assert_eq!(got1, vec![(0usize, vec![3.0, 1.0])]);
    }

    #[test]
    fn empty_routing_is_a_no_op() {
        let comm = crate::algs::communicator::NoComm;
        let out =
            exchange_values::<f64, _>(&comm, CommTag::new(0x0210), &[1.0], &[], &[]).unwrap();
        assert!(out.is_empty());
    }
}
