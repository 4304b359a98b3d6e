use super::index::FrameIndex;
use crate::common::*;

/// Splits dataset indices among the ranks of a process group.
///
/// Every rank computes the same permutation from `seed + epoch` before taking
/// its stride, so the shards are disjoint without any communication. The
/// permutation is padded by wrapping around to a multiple of `world_size`,
/// which keeps the number of optimizer steps equal on every rank.
#[derive(Debug, Clone)]
pub struct DistIndexSampler {
    len: usize,
    world_size: usize,
    rank: usize,
    seed: u64,
    shuffle: bool,
}

impl DistIndexSampler {
    pub fn new(len: usize, world_size: usize, rank: usize, seed: u64, shuffle: bool) -> Fallible<Self> {
        ensure!(world_size > 0, "world size must be positive");
        ensure!(
            rank < world_size,
            "rank {} is out of range for world size {}",
            rank,
            world_size
        );
        ensure!(len > 0, "cannot partition an empty dataset");

        Ok(Self {
            len,
            world_size,
            rank,
            seed,
            shuffle,
        })
    }

    /// The number of indices each rank receives per epoch.
    pub fn num_samples(&self) -> usize {
        (self.len + self.world_size - 1) / self.world_size
    }

    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut order = (0..self.len).collect::<Vec<_>>();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        order
            .iter()
            .copied()
            .cycle()
            .take(total)
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Assigns whole videos round-robin to ranks, keeping each video's chunks
/// in order so the recurrent state can cross chunk boundaries.
pub fn video_partition(index: &FrameIndex, world_size: usize, rank: usize) -> Vec<usize> {
    index
        .indices_by_video()
        .into_iter()
        .enumerate()
        .filter(|(video_id, _)| video_id % world_size == rank)
        .flat_map(|(_, indices)| indices)
        .collect()
}
