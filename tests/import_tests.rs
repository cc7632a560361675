//! Multi-participant sparse import scenarios over the in-process mailbox.

use std::sync::Arc;

use serial_test::serial;

use dist_vector::algs::communicator::{Communicator, MailboxComm};
use dist_vector::layout::IndexLayout;
use dist_vector::redistribute::CombineMode;
use dist_vector::vector::{DistVector, SparseImport};
use dist_vector::vector_error::DistVectorError;

fn on_two_ranks<T, F>(f: F) -> (T, T)
where
    T: Send + 'static,
    F: Fn(MailboxComm) -> T + Send + Sync + 'static,
{
    MailboxComm::reset();
    let f = Arc::new(f);
    let f0 = f.clone();
    let h0 = std::thread::spawn(move || f0(MailboxComm::new(0, 2)));
    let h1 = std::thread::spawn(move || f(MailboxComm::new(1, 2)));
    (h0.join().unwrap(), h1.join().unwrap())
}

#[test]
#[serial]
fn stored_pairs_land_on_their_owners() {
    // Rank 0 owns [0,3), rank 1 owns [3,6). Each rank stores one pair for
    // itself and one for the other rank.
    let (r0, r1) = on_two_ranks(|comm| {
        let me = comm.rank();
        let layout = IndexLayout::block_partition(6, me, 2).unwrap();
        let mut v = DistVector::<f64, _>::new(Arc::new(layout), Arc::new(comm));
        let imp = if me == 0 {
            SparseImport::new(vec![1, 4], vec![10.0, 40.0]).unwrap()
        } else {
            SparseImport::new(vec![5, 0], vec![50.0, 1.0]).unwrap()
        };
        v.import_from(&imp, CombineMode::Insert).unwrap();
        v.local_values().to_vec()
    });
    assert_eq!(r0, vec![1.0, 10.0, 0.0]);
    assert_eq!(r1, vec![0.0, 40.0, 50.0]);
}

#[test]
#[serial]
fn add_mode_accumulates_contributions_from_both_ranks() {
    // Both ranks contribute to global index 2 (owned by rank 0).
    let (r0, r1) = on_two_ranks(|comm| {
        let me = comm.rank();
        let layout = IndexLayout::block_partition(6, me, 2).unwrap();
        let mut v = DistVector::<f64, _>::new(Arc::new(layout), Arc::new(comm));
        v.fill(1.0).unwrap();
        let imp = if me == 0 {
            SparseImport::new(vec![2], vec![5.0]).unwrap()
        } else {
            SparseImport::new(vec![2, 2], vec![7.0, 0.5]).unwrap()
        };
        v.import_from(&imp, CombineMode::Add).unwrap();
        v.local_values().to_vec()
    });
    assert_eq!(r0, vec![1.0, 1.0, 13.5]);
    assert_eq!(r1, vec![1.0, 1.0, 1.0]);
}

#[test]
#[serial]
fn insert_overlap_resolves_to_the_highest_rank() {
    // Both ranks insert at global index 1; contributions fuse in ascending
    // rank order, so rank 1's value wins.
    let (r0, _r1) = on_two_ranks(|comm| {
        let me = comm.rank();
        let layout = IndexLayout::block_partition(4, me, 2).unwrap();
        let mut v = DistVector::<f64, _>::new(Arc::new(layout), Arc::new(comm));
        let imp = if me == 0 {
            SparseImport::new(vec![1], vec![100.0]).unwrap()
        } else {
            SparseImport::new(vec![1], vec![200.0]).unwrap()
        };
        v.import_from(&imp, CombineMode::Insert).unwrap();
        v.local_values().to_vec()
    });
    assert_eq!(r0, vec![0.0, 200.0]);
}

#[test]
#[serial]
fn unsupported_mode_leaves_both_ranks_untouched() {
    let (r0, r1) = on_two_ranks(|comm| {
        let me = comm.rank();
        let layout = IndexLayout::block_partition(4, me, 2).unwrap();
        let mut v = DistVector::<f64, _>::new(Arc::new(layout), Arc::new(comm));
        v.fill(3.0).unwrap();
        let imp = SparseImport::new(vec![0], vec![9.0]).unwrap();
        let err = v.import_from(&imp, CombineMode::Max).unwrap_err();
        (err, v.local_values().to_vec())
    });
    assert!(matches!(r0.0, DistVectorError::NotImplemented(_)));
    assert_eq!(r0.1, vec![3.0, 3.0]);
    assert_eq!(r1.1, vec![3.0, 3.0]);
}

#[test]
#[serial]
fn repeated_import_reuses_the_cached_routing() {
    // The second import must not rebuild the plan; with a stale (rebuilt)
    // routing the collectives would misalign and this test would hang or
    // produce wrong values.
    let (r0, r1) = on_two_ranks(|comm| {
        let me = comm.rank();
        let layout = IndexLayout::block_partition(4, me, 2).unwrap();
        let mut v = DistVector::<f64, _>::new(Arc::new(layout), Arc::new(comm));
        let indices = if me == 0 { vec![3] } else { vec![0] };
        let a = SparseImport::new(indices.clone(), vec![1.0]).unwrap();
        let b = SparseImport::new(indices, vec![2.0]).unwrap();
        v.import_from(&a, CombineMode::Insert).unwrap();
        v.import_from(&b, CombineMode::Add).unwrap();
        v.local_values().to_vec()
    });
    assert_eq!(r0, vec![3.0, 0.0]);
    assert_eq!(r1, vec![0.0, 3.0]);
}
