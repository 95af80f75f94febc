use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use candle_core::{DType, Tensor};

use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Blocking collective primitives over one process group.
///
/// Every member of the group must enter each call in the same order; a rank
/// that skips a collective deadlocks its peers.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn all_reduce(&self, values: &mut [f32], op: ReduceOp) -> Result<(), TrainingError>;

    /// Replaces `values` on every non-root rank with the root's buffer.
    fn broadcast(&self, values: &mut Vec<i64>, root: usize) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError>;
}

/// Group of one; every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce(&self, _values: &mut [f32], _op: ReduceOp) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut Vec<i64>, root: usize) -> Result<(), TrainingError> {
        if root != 0 {
            return Err(TrainingError::collective(format!(
                "broadcast root {root} outside a group of size 1"
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Float(Vec<f32>),
    Int(Vec<i64>),
}

const PEER_FAILED: &str = "process group aborted after a peer rank failed";

struct Rendezvous {
    slots: Vec<Option<Payload>>,
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Shared state of one in-process group: payload slots plus a reusable
/// barrier that can be torn down when a member fails.
struct GroupState {
    size: usize,
    inner: Mutex<Rendezvous>,
    released: Condvar,
}

impl GroupState {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            inner: Mutex::new(Rendezvous {
                slots: vec![None; size],
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Rendezvous>, TrainingError> {
        self.inner
            .lock()
            .map_err(|_| TrainingError::collective("process group state poisoned"))
    }

    /// Blocks until every member arrives, or fails once the group is aborted.
    fn wait(&self) -> Result<(), TrainingError> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(TrainingError::collective(PEER_FAILED));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self
                .released
                .wait(state)
                .map_err(|_| TrainingError::collective("process group state poisoned"))?;
        }
        if state.generation == generation {
            return Err(TrainingError::collective(PEER_FAILED));
        }
        Ok(())
    }

    /// Releases every current and future waiter with an error.
    fn abort(&self) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.aborted = true;
        self.released.notify_all();
    }

    fn publish(&self, rank: usize, payload: Payload) -> Result<(), TrainingError> {
        self.lock()?.slots[rank] = Some(payload);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Option<Payload>>, TrainingError> {
        Ok(self.lock()?.slots.clone())
    }

    fn clear(&self, rank: usize) -> Result<(), TrainingError> {
        self.lock()?.slots[rank] = None;
        Ok(())
    }

    /// Publish, rendezvous, read every slot, rendezvous again, then retract
    /// this rank's payload so it cannot satisfy a later collective.
    fn exchange(
        &self,
        rank: usize,
        payload: Option<Payload>,
    ) -> Result<Vec<Option<Payload>>, TrainingError> {
        if let Some(payload) = payload {
            self.publish(rank, payload)?;
        }
        self.wait()?;
        let slots = self.snapshot()?;
        // Nobody may overwrite a slot until every rank has read it.
        self.wait()?;
        self.clear(rank)?;
        Ok(slots)
    }
}

/// Member of an in-process group; ranks are threads sharing one [`GroupState`].
pub struct LocalCommunicator {
    rank: usize,
    state: Arc<GroupState>,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn all_reduce(&self, values: &mut [f32], op: ReduceOp) -> Result<(), TrainingError> {
        let slots = self
            .state
            .exchange(self.rank, Some(Payload::Float(values.to_vec())))?;

        let mut reduced: Option<Vec<f32>> = None;
        for (peer, slot) in slots.into_iter().enumerate() {
            let peer_values = match slot {
                Some(Payload::Float(peer_values)) => peer_values,
                _ => {
                    return Err(TrainingError::collective(format!(
                        "rank {peer} did not contribute to all_reduce"
                    )))
                }
            };
            if peer_values.len() != values.len() {
                return Err(TrainingError::collective(format!(
                    "all_reduce length mismatch: rank {} sent {} values, rank {} sent {}",
                    self.rank,
                    values.len(),
                    peer,
                    peer_values.len()
                )));
            }
            match reduced.as_mut() {
                None => reduced = Some(peer_values),
                Some(acc) => {
                    for (dst, src) in acc.iter_mut().zip(peer_values) {
                        *dst = match op {
                            ReduceOp::Sum => *dst + src,
                            ReduceOp::Max => dst.max(src),
                        };
                    }
                }
            }
        }

        if let Some(reduced) = reduced {
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn broadcast(&self, values: &mut Vec<i64>, root: usize) -> Result<(), TrainingError> {
        if root >= self.state.size {
            return Err(TrainingError::collective(format!(
                "broadcast root {root} outside a group of size {}",
                self.state.size
            )));
        }
        let payload = (self.rank == root).then(|| Payload::Int(values.clone()));
        let mut slots = self.state.exchange(self.rank, payload)?;

        if self.rank != root {
            match slots.swap_remove(root) {
                Some(Payload::Int(data)) => *values = data,
                _ => {
                    return Err(TrainingError::collective(format!(
                        "broadcast root {root} published no integer payload"
                    )))
                }
            }
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.state.wait()
    }
}

/// The three communicators one rank participates in.
///
/// Model-parallel groups are runs of consecutive global ranks
/// `[k * mp, (k + 1) * mp)`; data-parallel groups join the ranks that share a
/// model-parallel rank.
#[derive(Clone)]
pub struct ProcessGrid {
    global: Arc<dyn Communicator>,
    model_parallel: Arc<dyn Communicator>,
    data_parallel: Arc<dyn Communicator>,
}

impl ProcessGrid {
    pub fn new(
        global: Arc<dyn Communicator>,
        model_parallel: Arc<dyn Communicator>,
        data_parallel: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            global,
            model_parallel,
            data_parallel,
        }
    }

    pub fn single() -> Self {
        Self::new(
            Arc::new(SingleProcess),
            Arc::new(SingleProcess),
            Arc::new(SingleProcess),
        )
    }

    pub fn global(&self) -> &dyn Communicator {
        self.global.as_ref()
    }

    pub fn model_parallel(&self) -> &dyn Communicator {
        self.model_parallel.as_ref()
    }

    pub fn data_parallel(&self) -> &dyn Communicator {
        self.data_parallel.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.global.rank()
    }

    pub fn world_size(&self) -> usize {
        self.global.size()
    }

    pub fn model_parallel_rank(&self) -> usize {
        self.model_parallel.rank()
    }

    pub fn model_parallel_size(&self) -> usize {
        self.model_parallel.size()
    }

    pub fn data_parallel_rank(&self) -> usize {
        self.data_parallel.rank()
    }

    pub fn data_parallel_size(&self) -> usize {
        self.data_parallel.size()
    }

    /// The rank that reads data for its model-parallel group.
    pub fn is_data_source(&self) -> bool {
        self.model_parallel_rank() == 0
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// In-process process grid: one [`ProcessGrid`] per rank, all backed by
/// shared memory and [`std::sync::Barrier`]s.
pub struct LocalCluster;

impl LocalCluster {
    pub fn new(
        world_size: usize,
        model_parallel_size: usize,
    ) -> Result<Vec<ProcessGrid>, TrainingError> {
        Self::build(world_size, model_parallel_size).map(|(grids, _)| grids)
    }

    fn build(
        world_size: usize,
        model_parallel_size: usize,
    ) -> Result<(Vec<ProcessGrid>, Vec<Arc<GroupState>>), TrainingError> {
        if world_size == 0 || model_parallel_size == 0 {
            return Err(TrainingError::initialization(
                "process grid sizes must be greater than zero",
            ));
        }
        if world_size % model_parallel_size != 0 {
            return Err(TrainingError::initialization(format!(
                "world size {world_size} is not divisible by model-parallel size {model_parallel_size}"
            )));
        }
        let data_parallel_size = world_size / model_parallel_size;

        let global = GroupState::new(world_size);
        let model_groups: Vec<_> = (0..data_parallel_size)
            .map(|_| GroupState::new(model_parallel_size))
            .collect();
        let data_groups: Vec<_> = (0..model_parallel_size)
            .map(|_| GroupState::new(data_parallel_size))
            .collect();

        let grids = (0..world_size)
            .map(|rank| {
                let mp_rank = rank % model_parallel_size;
                let dp_rank = rank / model_parallel_size;
                ProcessGrid::new(
                    Arc::new(LocalCommunicator {
                        rank,
                        state: global.clone(),
                    }),
                    Arc::new(LocalCommunicator {
                        rank: mp_rank,
                        state: model_groups[dp_rank].clone(),
                    }),
                    Arc::new(LocalCommunicator {
                        rank: dp_rank,
                        state: data_groups[mp_rank].clone(),
                    }),
                )
            })
            .collect();

        let mut groups = vec![global];
        groups.extend(model_groups);
        groups.extend(data_groups);
        Ok((grids, groups))
    }

    /// Runs `body` once per rank on its own thread and collects the results
    /// in rank order.
    ///
    /// When a rank fails or panics every group is aborted, so peers blocked
    /// in a collective return instead of waiting forever. The error of the
    /// first rank to fail is returned.
    pub fn launch<F, T>(
        world_size: usize,
        model_parallel_size: usize,
        body: F,
    ) -> Result<Vec<T>, TrainingError>
    where
        F: Fn(ProcessGrid) -> Result<T, TrainingError> + Sync,
        T: Send,
    {
        let (grids, groups) = Self::build(world_size, model_parallel_size)?;
        let first_failure: Mutex<Option<usize>> = Mutex::new(None);
        let body = &body;
        let groups = groups.as_slice();
        let first_failure_ref = &first_failure;

        let results: Vec<Result<T, TrainingError>> = thread::scope(|scope| {
            let handles: Vec<_> = grids
                .into_iter()
                .enumerate()
                .map(|(rank, grid)| {
                    scope.spawn(move || {
                        let mut guard = AbortOnFailure {
                            rank,
                            groups,
                            first_failure: first_failure_ref,
                            armed: true,
                        };
                        let result = body(grid);
                        guard.armed = result.is_err();
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TrainingError::collective(format!("rank {rank} panicked")))
                    })
                })
                .collect()
        });

        let failed = match first_failure.lock() {
            Ok(failed) => *failed,
            Err(poisoned) => *poisoned.into_inner(),
        };
        match failed {
            Some(rank) => {
                let mut results = results;
                match results.swap_remove(rank) {
                    Err(err) => Err(err),
                    Ok(_) => Err(TrainingError::collective(format!("rank {rank} failed"))),
                }
            }
            None => results.into_iter().collect(),
        }
    }
}

/// Aborts every group of the cluster unless disarmed, recording the first
/// rank that tripped it. Dropping while armed covers both an error return
/// and a panic unwinding out of the rank body.
struct AbortOnFailure<'a> {
    rank: usize,
    groups: &'a [Arc<GroupState>],
    first_failure: &'a Mutex<Option<usize>>,
    armed: bool,
}

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut failed = match self.first_failure.lock() {
            Ok(failed) => failed,
            Err(poisoned) => poisoned.into_inner(),
        };
        if failed.is_none() {
            *failed = Some(self.rank);
        }
        drop(failed);
        for group in self.groups {
            group.abort();
        }
    }
}

/// All-reduces a scalar.
pub fn all_reduce_scalar(
    comm: &dyn Communicator,
    value: f32,
    op: ReduceOp,
) -> Result<f32, TrainingError> {
    let mut buffer = [value];
    comm.all_reduce(&mut buffer, op)?;
    Ok(buffer[0])
}

/// Sums every tensor across the group in one flattened bucket and returns the
/// reduced tensors in the same order and shapes (as `f32`).
pub fn all_reduce_tensors(
    comm: &dyn Communicator,
    tensors: &[Tensor],
    op: ReduceOp,
) -> Result<Vec<Tensor>, TrainingError> {
    if comm.size() == 1 {
        return tensors
            .iter()
            .map(|tensor| tensor.to_dtype(DType::F32).map_err(to_runtime_error))
            .collect();
    }

    let mut bucket = Vec::new();
    for tensor in tensors {
        let flat = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        bucket.extend(flat);
    }
    comm.all_reduce(&mut bucket, op)?;

    let mut offset = 0;
    let mut reduced = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        let count = tensor.elem_count();
        let values = bucket[offset..offset + count].to_vec();
        offset += count;
        reduced.push(
            Tensor::from_vec(values, tensor.dims(), tensor.device()).map_err(to_runtime_error)?,
        );
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout_groups_consecutive_ranks() {
        let grids = LocalCluster::new(4, 2).unwrap();
        let layout: Vec<_> = grids
            .iter()
            .map(|grid| {
                (
                    grid.rank(),
                    grid.model_parallel_rank(),
                    grid.data_parallel_rank(),
                )
            })
            .collect();
        assert_eq!(layout, vec![(0, 0, 0), (1, 1, 0), (2, 0, 1), (3, 1, 1)]);
        assert!(grids.iter().all(|grid| grid.data_parallel_size() == 2));
    }

    #[test]
    fn all_reduce_sums_and_maxes_across_threads() {
        let results = LocalCluster::launch(3, 1, |grid| {
            let rank = grid.rank() as f32;
            let sum = all_reduce_scalar(grid.global(), rank + 1.0, ReduceOp::Sum)?;
            let max = all_reduce_scalar(grid.global(), rank, ReduceOp::Max)?;
            Ok((sum, max))
        })
        .unwrap();
        assert!(results.iter().all(|&(sum, max)| sum == 6.0 && max == 2.0));
    }

    #[test]
    fn broadcast_copies_root_buffer() {
        let results = LocalCluster::launch(2, 2, |grid| {
            let mut values = if grid.is_data_source() {
                vec![7, 8, 9]
            } else {
                Vec::new()
            };
            grid.model_parallel().broadcast(&mut values, 0)?;
            Ok(values)
        })
        .unwrap();
        assert_eq!(results, vec![vec![7, 8, 9], vec![7, 8, 9]]);
    }

    #[test]
    fn mismatched_lengths_fail_on_every_rank() {
        let results = LocalCluster::launch(2, 1, |grid| {
            let mut values = vec![1.0; grid.rank() + 1];
            Ok(grid.global().all_reduce(&mut values, ReduceOp::Sum).is_err())
        })
        .unwrap();
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn collectives_leave_no_payload_behind() {
        let comm = LocalCommunicator {
            rank: 0,
            state: GroupState::new(1),
        };
        let mut floats = vec![1.0, 2.0];
        comm.all_reduce(&mut floats, ReduceOp::Sum).unwrap();
        let mut ints = vec![3, 4];
        comm.broadcast(&mut ints, 0).unwrap();
        assert!(comm.state.snapshot().unwrap().iter().all(Option::is_none));
    }

    #[test]
    fn stale_payloads_do_not_satisfy_a_later_all_reduce() {
        let results = LocalCluster::launch(2, 1, |grid| {
            let comm = grid.global();
            let mut first = vec![1.0];
            comm.all_reduce(&mut first, ReduceOp::Sum)?;
            // Rank 1 joins the second round without a float payload.
            if comm.rank() == 1 {
                let mut ints = Vec::new();
                return Ok(comm.broadcast(&mut ints, 0).is_err());
            }
            let mut second = vec![1.0];
            Ok(comm.all_reduce(&mut second, ReduceOp::Sum).is_err())
        })
        .unwrap();
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn failing_rank_releases_peers_blocked_in_a_barrier() {
        let outcome = LocalCluster::launch(3, 1, |grid| {
            if grid.rank() == 2 {
                return Err(TrainingError::runtime("rank 2 gave up"));
            }
            grid.global().barrier()
        });
        match outcome {
            Err(TrainingError::Runtime(message)) => assert_eq!(message, "rank 2 gave up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn aborted_group_fails_new_arrivals() {
        let state = GroupState::new(2);
        state.abort();
        assert!(matches!(state.wait(), Err(TrainingError::Collective(_))));
    }

    #[test]
    fn rejects_indivisible_grid() {
        assert!(LocalCluster::new(3, 2).is_err());
    }
}
