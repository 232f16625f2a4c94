//! Agreement on a value across training workers.
//!
//! The codec only needs one collective: the root worker publishes a small
//! integer and every worker receives it. `LocalBroadcast` is the trivial
//! single-worker case, [`thread_group`] connects workers running as threads
//! of one process. A multi-process backend implements the same trait.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::error::{CodecError, Result};

/// Collective that distributes `root`'s value to every worker.
pub trait Broadcast: Send + Sync {
    /// Rank of the calling worker.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Return the value passed by worker `root`.
    ///
    /// Blocks until every worker of the group has called it.
    fn broadcast(&self, value: usize, root: usize) -> Result<usize>;
}

/// Group of exactly one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBroadcast;

impl Broadcast for LocalBroadcast {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, value: usize, root: usize) -> Result<usize> {
        if root != 0 {
            return Err(CodecError::Broadcast(format!(
                "root rank {root} outside of a single-worker group"
            )));
        }
        Ok(value)
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slot: Mutex<Option<usize>>,
    world_size: usize,
}

/// Create `world_size` connected members, ranked `0..world_size`.
///
/// Move each member to its own thread.
pub fn thread_group(world_size: usize) -> Vec<GroupMember> {
    let shared = Arc::new(Shared {
        barrier: Barrier::new(world_size.max(1)),
        slot: Mutex::new(None),
        world_size,
    });
    (0..world_size)
        .map(|rank| GroupMember {
            rank,
            shared: Arc::clone(&shared),
        })
        .collect()
}

/// One worker's handle on a group of threads from [`thread_group`].
#[derive(Debug, Clone)]
pub struct GroupMember {
    rank: usize,
    shared: Arc<Shared>,
}

impl Broadcast for GroupMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn broadcast(&self, value: usize, root: usize) -> Result<usize> {
        if root >= self.shared.world_size {
            return Err(CodecError::Broadcast(format!(
                "root rank {root} outside of a group of {}",
                self.shared.world_size
            )));
        }

        if self.rank == root {
            *self.shared.slot.lock() = Some(value);
        }
        self.shared.barrier.wait();
        let received = *self.shared.slot.lock();
        // second rendezvous keeps the root from overwriting the slot early
        self.shared.barrier.wait();

        received.ok_or_else(|| CodecError::Broadcast("root published no value".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_broadcast_is_identity() {
        assert_eq!(LocalBroadcast.broadcast(3, 0).unwrap(), 3);
        assert!(LocalBroadcast.broadcast(3, 1).is_err());
    }

    #[test]
    fn test_thread_group_delivers_root_value() {
        let members = thread_group(3);
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for round in 0..5 {
                        let value = member.rank() * 100 + round;
                        seen.push(member.broadcast(value, 0).unwrap());
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_thread_group_rejects_unknown_root() {
        let members = thread_group(1);
        assert!(members[0].broadcast(1, 2).is_err());
    }
}
