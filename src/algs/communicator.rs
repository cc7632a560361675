//! Thin façade over intra-process (mailbox) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking -– the collective helpers in
//! [`crate::algs::collective`] call `.wait()` before they trust that a buffer
//! is ready.

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Typed communication tag. Each collective stage uses a distinct tag so that
/// back-to-back exchanges on the same communicator never alias.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(v: u16) -> Self {
        CommTag(v)
    }
    #[inline]
    pub const fn base(self) -> u16 {
        self.0
    }
    /// Derive a stage tag at a fixed offset from this base tag.
    #[inline]
    pub const fn offset(self, k: u16) -> CommTag {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// This participant's rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of participants in the computation.
    fn size(&self) -> usize;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Compile-time no-op comm for a single-participant computation and for pure
/// serial unit tests. Rank 0 of 1; every collective degenerates to a local op.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- MailboxComm: intra-process / multi-thread rank simulation ---

type Key = (usize, usize, u16); // (src, dst, tag)

/// FIFO per-(src,dst,tag) queues; sends between a rank pair with the same tag
/// are received in posting order.
static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);

pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock();
        guard.take()
    }
}

/// In-process communicator: each "rank" is a thread sharing a global mailbox.
/// Used by the multi-rank integration tests; tests touching it must be
/// serialized because the mailbox is process-global.
#[derive(Clone, Debug)]
pub struct MailboxComm {
    rank: usize,
    size: usize,
}

impl MailboxComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Drop any messages left over from an aborted exchange.
    /// Call between tests that share the process-global mailbox.
    pub fn reset() {
        MAILBOX.clear();
    }
}

impl Communicator for MailboxComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::from(buf.to_vec()));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LocalHandle {
        let key = (peer, self.rank, tag);
        let slot = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let buf_len = buf.len();
        let handle = std::thread::spawn(move || {
            loop {
                let popped = MAILBOX.get_mut(&key).and_then(|mut q| q.pop_front());
                if let Some(bytes) = popped {
                    let n = buf_len.min(bytes.len());
                    *slot_clone.lock() = Some(bytes[..n].to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: slot,
            handle: Some(handle),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI-backed communicator. Sends complete eagerly (standard-mode send);
    /// receives are matched when the handle is waited on. The staged
    /// exchanges in this crate keep messages small enough for the eager
    /// protocol, and every rank drains its handles in the same order.
    pub struct MpiComm {
        _universe: mpi::environment::Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let universe = mpi::initialize().expect("MPI already initialized");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    pub struct MpiRecvHandle {
        world: SimpleCommunicator,
        peer: usize,
        tag: u16,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(self.peer as i32)
                .receive_vec_with_tag::<u8>(self.tag as i32);
            let n = self.len.min(data.len());
            Some(data[..n].to_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                world: self.world.duplicate(),
                peer,
                tag,
                len: buf.len(),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
