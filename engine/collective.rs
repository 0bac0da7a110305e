//! # Collective Aggregator
//!
//! Blocking all-reduce and broadcast between the ranks of one fit, wired as a star
//! around rank 0 with `crossbeam-channel`. Rank 0 gathers contributions in ascending rank
//! order, so a given partitioning always sums in the same order and produces bit-identical
//! results.
//!
//! Every operation is a barrier: a rank returns only after all ranks have entered the same
//! call. A peer that has gone away (its [`Communicator`] was dropped, typically because it
//! failed) turns the next operation into `CollectiveFailure` on every surviving rank.
//! There is no partial quorum.

use crate::error::FitError;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Call counters shared by every communicator of a group.
#[derive(Debug, Default)]
pub struct CollectiveStats {
    all_reduce_calls: AtomicU64,
    broadcast_calls: AtomicU64,
    reduced_values: AtomicU64,
}

impl CollectiveStats {
    pub fn all_reduce_calls(&self) -> u64 {
        self.all_reduce_calls.load(Ordering::Relaxed)
    }

    pub fn broadcast_calls(&self) -> u64 {
        self.broadcast_calls.load(Ordering::Relaxed)
    }

    /// Total `f64` values summed over all all-reduce calls.
    pub fn reduced_values(&self) -> u64 {
        self.reduced_values.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    AllReduce,
    Broadcast,
}

impl Op {
    fn describe(self) -> &'static str {
        match self {
            Op::AllReduce => "all-reduce",
            Op::Broadcast => "broadcast",
        }
    }
}

#[derive(Debug)]
struct Message {
    op: Op,
    payload: Vec<f64>,
}

#[derive(Debug)]
enum Link {
    Root {
        from_leaves: Vec<Receiver<Message>>,
        to_leaves: Vec<Sender<Message>>,
    },
    Leaf {
        to_root: Sender<Message>,
        from_root: Receiver<Message>,
    },
}

/// A set of ranks that aggregate together.
#[derive(Debug, Clone)]
pub struct CollectiveGroup {
    world_size: usize,
    stats: Arc<CollectiveStats>,
}

impl CollectiveGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            stats: Arc::new(CollectiveStats::default()),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn stats(&self) -> &CollectiveStats {
        &self.stats
    }

    /// Creates one communicator per rank, index = rank.
    pub fn connect(&self) -> Vec<Communicator> {
        if self.world_size == 0 {
            return Vec::new();
        }
        let mut from_leaves = Vec::with_capacity(self.world_size - 1);
        let mut to_leaves = Vec::with_capacity(self.world_size - 1);
        let mut leaves = Vec::with_capacity(self.world_size - 1);
        for rank in 1..self.world_size {
            let (up_tx, up_rx) = unbounded();
            let (down_tx, down_rx) = unbounded();
            from_leaves.push(up_rx);
            to_leaves.push(down_tx);
            leaves.push(Communicator {
                rank,
                world_size: self.world_size,
                link: Link::Leaf {
                    to_root: up_tx,
                    from_root: down_rx,
                },
                stats: Arc::clone(&self.stats),
            });
        }
        let mut comms = Vec::with_capacity(self.world_size);
        comms.push(Communicator {
            rank: 0,
            world_size: self.world_size,
            link: Link::Root {
                from_leaves,
                to_leaves,
            },
            stats: Arc::clone(&self.stats),
        });
        comms.extend(leaves);
        comms
    }
}

/// One rank's endpoint into its group.
#[derive(Debug)]
pub struct Communicator {
    rank: usize,
    world_size: usize,
    link: Link,
    stats: Arc<CollectiveStats>,
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    fn failure(&self, reason: String) -> FitError {
        FitError::CollectiveFailure {
            rank: self.rank,
            reason,
        }
    }

    /// Replaces `buffer` on every rank with the element-wise sum of all ranks' buffers.
    pub fn all_reduce_sum(&self, buffer: &mut [f64]) -> Result<(), FitError> {
        match &self.link {
            Link::Root {
                from_leaves,
                to_leaves,
            } => {
                self.stats.all_reduce_calls.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .reduced_values
                    .fetch_add(buffer.len() as u64, Ordering::Relaxed);
                for (offset, receiver) in from_leaves.iter().enumerate() {
                    let contribution = self.receive(receiver, offset + 1, Op::AllReduce, buffer.len())?;
                    for (acc, value) in buffer.iter_mut().zip(contribution) {
                        *acc += value;
                    }
                }
                for (offset, sender) in to_leaves.iter().enumerate() {
                    self.send(sender, offset + 1, Op::AllReduce, buffer.to_vec())?;
                }
                Ok(())
            }
            Link::Leaf { to_root, from_root } => {
                self.send(to_root, 0, Op::AllReduce, buffer.to_vec())?;
                let total = self.receive(from_root, 0, Op::AllReduce, buffer.len())?;
                buffer.copy_from_slice(&total);
                Ok(())
            }
        }
    }

    /// Replaces `buffer` on every rank with rank 0's contents.
    pub fn broadcast(&self, buffer: &mut [f64]) -> Result<(), FitError> {
        match &self.link {
            Link::Root { to_leaves, .. } => {
                self.stats.broadcast_calls.fetch_add(1, Ordering::Relaxed);
                for (offset, sender) in to_leaves.iter().enumerate() {
                    self.send(sender, offset + 1, Op::Broadcast, buffer.to_vec())?;
                }
                Ok(())
            }
            Link::Leaf { from_root, .. } => {
                let data = self.receive(from_root, 0, Op::Broadcast, buffer.len())?;
                buffer.copy_from_slice(&data);
                Ok(())
            }
        }
    }

    fn send(
        &self,
        sender: &Sender<Message>,
        peer: usize,
        op: Op,
        payload: Vec<f64>,
    ) -> Result<(), FitError> {
        sender
            .send(Message { op, payload })
            .map_err(|_| self.failure(format!("rank {peer} left the group during {}", op.describe())))
    }

    fn receive(
        &self,
        receiver: &Receiver<Message>,
        peer: usize,
        expected: Op,
        len: usize,
    ) -> Result<Vec<f64>, FitError> {
        let message = receiver.recv().map_err(|_| {
            self.failure(format!(
                "rank {peer} left the group during {}",
                expected.describe()
            ))
        })?;
        if message.op != expected {
            return Err(self.failure(format!(
                "rank {peer} sent a {} while a {} was expected",
                message.op.describe(),
                expected.describe()
            )));
        }
        if message.payload.len() != len {
            return Err(self.failure(format!(
                "rank {peer} sent {} values for a {}-value {}",
                message.payload.len(),
                len,
                expected.describe()
            )));
        }
        Ok(message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_returns_identical_sums() {
        let group = CollectiveGroup::new(4);
        let results: Vec<Vec<f64>> = thread::scope(|scope| {
            let handles: Vec<_> = group
                .connect()
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let r = comm.rank() as f64;
                        let mut buffer = vec![r, 10.0 * r, 1.0];
                        comm.all_reduce_sum(&mut buffer).unwrap();
                        buffer
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for buffer in &results {
            assert_eq!(buffer, &vec![6.0, 60.0, 4.0]);
        }
        assert_eq!(group.stats().all_reduce_calls(), 1);
        assert_eq!(group.stats().reduced_values(), 3);
    }

    #[test]
    fn broadcast_replicates_root_buffer() {
        let group = CollectiveGroup::new(3);
        let results: Vec<Vec<f64>> = thread::scope(|scope| {
            let handles: Vec<_> = group
                .connect()
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let mut buffer = if comm.is_root() {
                            vec![1.5, -2.0]
                        } else {
                            vec![0.0, 0.0]
                        };
                        comm.broadcast(&mut buffer).unwrap();
                        buffer
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|b| b == &vec![1.5, -2.0]));
        assert_eq!(group.stats().broadcast_calls(), 1);
    }

    #[test]
    fn single_rank_group_is_identity() {
        let group = CollectiveGroup::new(1);
        let comms = group.connect();
        assert_eq!(comms.len(), 1);
        let mut buffer = vec![3.0];
        comms[0].all_reduce_sum(&mut buffer).unwrap();
        comms[0].broadcast(&mut buffer).unwrap();
        assert_eq!(buffer, vec![3.0]);
    }

    #[test]
    fn dropped_peer_fails_every_survivor() {
        let group = CollectiveGroup::new(3);
        let mut comms = group.connect();
        drop(comms.remove(2));
        let outcomes: Vec<Result<(), FitError>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let mut buffer = vec![1.0];
                        comm.all_reduce_sum(&mut buffer)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Err(FitError::CollectiveFailure { rank: failed, .. }) => assert_eq!(failed, rank),
                other => panic!("rank {rank} expected a collective failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let group = CollectiveGroup::new(2);
        let outcomes: Vec<Result<(), FitError>> = thread::scope(|scope| {
            let handles: Vec<_> = group
                .connect()
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let mut buffer = vec![1.0; comm.rank() + 1];
                        comm.all_reduce_sum(&mut buffer)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(matches!(
            outcomes[0],
            Err(FitError::CollectiveFailure { rank: 0, .. })
        ));
        assert!(matches!(
            outcomes[1],
            Err(FitError::CollectiveFailure { rank: 1, .. })
        ));
    }
}
