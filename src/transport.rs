//! Message-passing abstraction. The actual MPI transport implementation
//! is out of scope here; the core only ever talks to a [`Transport`], so a
//! real deployment can back it with MPI (or anything else) without
//! touching ensemble, migration, or balancing code.
//!
//! The wire protocol — tagged sends of particle data and contiguous field
//! arrays — is carried as opaque bytes here; call sites serialize with
//! `bincode` before handing data to a `Transport` and deserialize what
//! comes back.

/// A pending non-blocking send/receive. Callers must `wait()` before
/// reusing the buffer that was handed to the operation that produced it,
/// mirroring the half of MPI's request model the balancer actually uses
/// (see `detailed_balance`'s asymmetric `Isend`/blocking-`recv` pairing).
pub trait Handle {
    fn wait(self: Box<Self>);
}

/// One rank's view of a communicator. Implementations are expected to be
/// cheaply cloneable handles onto shared transport state (an MPI
/// communicator, a channel set, …).
pub trait Transport: Clone + Send {
    type Handle: Handle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Splits this communicator by `color`; ranks sharing a color end up in
    /// the same child communicator, ordered by their rank in `self`. A
    /// color of `None` excludes the calling rank from every child.
    fn split(&self, color: Option<i32>) -> Self;

    /// Every rank's `data`, gathered in rank order.
    fn allgather(&self, data: &[u8]) -> Vec<Vec<u8>>;

    /// Sum-reduction of `value` across all ranks; only the root's return
    /// value is meaningful (non-root implementations may return `None`).
    fn reduce_sum(&self, value: u64, root: usize) -> Option<u64>;

    /// Broadcasts `value` from `root` to all ranks, returning the shared
    /// value.
    fn broadcast_u64(&self, value: u64, root: usize) -> u64;

    /// Blocking send of a tagged byte buffer.
    fn send(&self, dest: usize, tag: i32, data: &[u8]);

    /// Blocking receive of a tagged byte buffer from `src`.
    fn recv(&self, src: usize, tag: i32) -> Vec<u8>;

    /// Non-blocking send; the returned handle must be waited on before the
    /// underlying buffer of `data` may be reused.
    fn isend(&self, dest: usize, tag: i32, data: Vec<u8>) -> Self::Handle;
}

/// A trivial single-rank implementation: `rank() == 0`, `size() == 1`.
/// Every collective is a local identity; point-to-point calls are never
/// reachable in a correctly partitioned one-rank run (there is no peer to
/// talk to), so they panic rather than silently doing nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

pub struct LocalHandle;

impl Handle for LocalHandle {
    fn wait(self: Box<Self>) {}
}

impl Transport for LocalTransport {
    type Handle = LocalHandle;

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn split(&self, color: Option<i32>) -> LocalTransport {
        match color {
            Some(_) => LocalTransport,
            None => LocalTransport,
        }
    }

    fn allgather(&self, data: &[u8]) -> Vec<Vec<u8>> {
        vec![data.to_vec()]
    }

    fn reduce_sum(&self, value: u64, _root: usize) -> Option<u64> {
        Some(value)
    }

    fn broadcast_u64(&self, value: u64, _root: usize) -> u64 {
        value
    }

    fn send(&self, dest: usize, _tag: i32, _data: &[u8]) {
        unreachable!("LocalTransport has no peer to send to (dest={})", dest);
    }

    fn recv(&self, src: usize, _tag: i32) -> Vec<u8> {
        unreachable!("LocalTransport has no peer to receive from (src={})", src);
    }

    fn isend(&self, dest: usize, _tag: i32, _data: Vec<u8>) -> LocalHandle {
        unreachable!("LocalTransport has no peer to send to (dest={})", dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_transport_is_a_singleton_rank() {
        let t = LocalTransport;
        assert_eq!(t.rank(), 0);
        assert_eq!(t.size(), 1);
        assert_eq!(t.allgather(&[1, 2, 3]), vec![vec![1, 2, 3]]);
        assert_eq!(t.reduce_sum(42, 0), Some(42));
        assert_eq!(t.broadcast_u64(7, 0), 7);
    }
}
