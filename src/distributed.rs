use crate::common::*;

/// Whether a worker performs side-effecting I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Rank zero, writes logs, checkpoints, images and scores.
    Primary,
    Replica,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        match rank {
            0 => Self::Primary,
            _ => Self::Replica,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

/// Synchronous collectives among the workers of one data-parallel job.
///
/// Every member must enter each collective in the same order. A member that
/// fails before reaching a collective leaves the others blocked, so callers
/// treat any worker failure as fatal for the whole job.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn role(&self) -> Role {
        Role::from_rank(self.rank())
    }

    /// Replaces each tensor in place by its mean over all members.
    fn all_reduce_mean(&self, tensors: &mut [Tensor]) -> Fallible<()>;

    /// Replaces each value by its sum over all members.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Fallible<()>;

    /// Overwrites the tensors of every member with the primary's.
    fn broadcast_from_primary(&self, tensors: &mut [Tensor]) -> Fallible<()>;

    /// True on every member when any member passes true.
    fn any(&self, flag: bool) -> Fallible<bool> {
        let mut values = [if flag { 1.0 } else { 0.0 }];
        self.all_reduce_sum(&mut values)?;
        Ok(values[0] > 0.0)
    }
}

/// The group of a job running on one device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _tensors: &mut [Tensor]) -> Fallible<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Fallible<()> {
        Ok(())
    }

    fn broadcast_from_primary(&self, _tensors: &mut [Tensor]) -> Fallible<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct LocalShared {
    world_size: usize,
    barrier: Barrier,
    tensors: Mutex<Option<Vec<Tensor>>>,
    values: Mutex<Option<Vec<f64>>>,
}

/// An in-process group whose members are threads, one per device.
///
/// Collectives run in three barrier-separated phases: every member writes
/// its contribution, every member reads the result, then the barrier leader
/// clears the shared slot for the next collective.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<LocalShared>,
}

impl LocalGroup {
    /// Creates the members of a group of `world_size` threads, ordered by rank.
    pub fn new(world_size: usize) -> Fallible<Vec<Self>> {
        ensure!(world_size > 0, "world size must be positive");

        let shared = Arc::new(LocalShared {
            world_size,
            barrier: Barrier::new(world_size),
            tensors: Mutex::new(None),
            values: Mutex::new(None),
        });

        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect())
    }

    fn lock<T>(mutex: &Mutex<T>) -> Fallible<std::sync::MutexGuard<'_, T>> {
        mutex
            .lock()
            .map_err(|_| format_err!("a process group member panicked"))
    }

    /// Waits for all members, lets the leader clear the slot, then waits again.
    fn finish<T>(&self, slot: &Mutex<Option<T>>) -> Fallible<()> {
        if self.shared.barrier.wait().is_leader() {
            Self::lock(slot)?.take();
        }
        self.shared.barrier.wait();
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, tensors: &mut [Tensor]) -> Fallible<()> {
        let slot = &self.shared.tensors;

        {
            let mut sums = Self::lock(slot)?;
            match sums.as_mut() {
                None => {
                    let copies = tch::no_grad(|| {
                        tensors
                            .iter()
                            .map(|tensor| tensor.detach().copy())
                            .collect::<Vec<_>>()
                    });
                    *sums = Some(copies);
                }
                Some(sums) => {
                    ensure!(
                        sums.len() == tensors.len(),
                        "rank {} reduces {} tensors, other ranks reduce {}",
                        self.rank,
                        tensors.len(),
                        sums.len()
                    );
                    tch::no_grad(|| {
                        for (sum, tensor) in sums.iter_mut().zip(tensors.iter()) {
                            let update = tensor.to_device(sum.device());
                            *sum += update;
                        }
                    });
                }
            }
        }
        self.shared.barrier.wait();

        {
            let sums = Self::lock(slot)?;
            let sums = sums
                .as_ref()
                .ok_or_else(|| format_err!("reduction slot is empty"))?;
            let scale = 1.0 / self.shared.world_size as f64;
            tch::no_grad(|| {
                for (tensor, sum) in tensors.iter_mut().zip(sums.iter()) {
                    tensor.copy_(&(sum.to_device(tensor.device()) * scale));
                }
            });
        }
        self.finish(slot)
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Fallible<()> {
        let slot = &self.shared.values;

        {
            let mut sums = Self::lock(slot)?;
            match sums.as_mut() {
                None => *sums = Some(values.to_vec()),
                Some(sums) => {
                    ensure!(
                        sums.len() == values.len(),
                        "rank {} reduces {} values, other ranks reduce {}",
                        self.rank,
                        values.len(),
                        sums.len()
                    );
                    sums.iter_mut()
                        .zip(values.iter())
                        .for_each(|(sum, value)| *sum += value);
                }
            }
        }
        self.shared.barrier.wait();

        {
            let sums = Self::lock(slot)?;
            let sums = sums
                .as_ref()
                .ok_or_else(|| format_err!("reduction slot is empty"))?;
            values.copy_from_slice(sums);
        }
        self.finish(slot)
    }

    fn broadcast_from_primary(&self, tensors: &mut [Tensor]) -> Fallible<()> {
        let slot = &self.shared.tensors;

        if self.role().is_primary() {
            let copies = tch::no_grad(|| {
                tensors
                    .iter()
                    .map(|tensor| tensor.detach().copy())
                    .collect::<Vec<_>>()
            });
            *Self::lock(slot)? = Some(copies);
        }
        self.shared.barrier.wait();

        if !self.role().is_primary() {
            let sources = Self::lock(slot)?;
            let sources = sources
                .as_ref()
                .ok_or_else(|| format_err!("broadcast slot is empty"))?;
            ensure!(
                sources.len() == tensors.len(),
                "rank {} receives {} tensors, the primary sends {}",
                self.rank,
                tensors.len(),
                sources.len()
            );
            tch::no_grad(|| {
                for (tensor, source) in tensors.iter_mut().zip(sources.iter()) {
                    tensor.copy_(&source.to_device(tensor.device()));
                }
            });
        }
        self.finish(slot)
    }
}
