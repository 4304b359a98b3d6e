use super::{index::ChunkIndex, sampler::Sample, sampler::SequenceSampler};
use crate::common::*;
use crossbeam::channel::{self, Receiver};

/// A batch of samples, `[batch, time, channel, height, width]`.
#[derive(Debug, TensorLike)]
pub struct ChunkBatch {
    pub input: Tensor,
    pub gt: Tensor,
    #[tensor_like(clone)]
    pub chunks: Vec<ChunkIndex>,
    #[tensor_like(clone)]
    pub is_first: Vec<bool>,
}

impl ChunkBatch {
    pub fn collate(samples: Vec<Sample>) -> Fallible<Self> {
        ensure!(!samples.is_empty(), "cannot collate an empty batch");

        let size = samples[0].input.size();
        if let Some(sample) = samples.iter().find(|sample| sample.input.size() != size) {
            return Err(DeblurError::dimension(format!(
                "samples of one batch differ in shape: {:?} and {:?}",
                size,
                sample.input.size()
            ))
            .into());
        }

        let inputs = samples.iter().map(|sample| &sample.input).collect::<Vec<_>>();
        let gts = samples.iter().map(|sample| &sample.gt).collect::<Vec<_>>();

        Ok(Self {
            input: Tensor::stack(&inputs, 0),
            gt: Tensor::stack(&gts, 0),
            chunks: samples.iter().map(|sample| sample.chunk).collect(),
            is_first: samples.iter().map(|sample| sample.is_first).collect(),
        })
    }

    pub fn batch_size(&self) -> i64 {
        self.input.size()[0]
    }

    pub fn num_frames(&self) -> i64 {
        self.input.size()[1]
    }
}

#[derive(Debug, Clone)]
pub struct ChunkLoaderInit {
    pub batch_size: usize,
    pub prefetch: usize,
    /// Per-sample random streams are derived from this seed and the index.
    pub seed: u64,
}

impl ChunkLoaderInit {
    /// Starts a producer thread that materializes `indices` batch by batch.
    ///
    /// The first error ends the stream after being yielded.
    pub fn spawn(
        self,
        sampler: Arc<SequenceSampler>,
        pool: Arc<rayon::ThreadPool>,
        indices: Vec<usize>,
    ) -> Fallible<ChunkLoader> {
        let Self {
            batch_size,
            prefetch,
            seed,
        } = self;
        ensure!(batch_size > 0, "batch size must be positive");

        let num_batches = (indices.len() + batch_size - 1) / batch_size;
        let (sender, receiver) = channel::bounded(prefetch.max(1));

        let handle = thread::Builder::new()
            .name("chunk_loader".into())
            .spawn(move || {
                for batch_indices in indices.chunks(batch_size) {
                    let batch = pool.install(|| {
                        batch_indices
                            .par_iter()
                            .map(|&index| {
                                let mut rng = StdRng::seed_from_u64(
                                    seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                                );
                                sampler.sample(index, &mut rng)
                            })
                            .collect::<Fallible<Vec<_>>>()
                    });
                    let batch = batch.and_then(ChunkBatch::collate);
                    let failed = batch.is_err();

                    if sender.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(ChunkLoader {
            receiver: Some(receiver),
            handle: Some(handle),
            num_batches,
        })
    }
}

#[derive(Debug)]
pub struct ChunkLoader {
    receiver: Option<Receiver<Fallible<ChunkBatch>>>,
    handle: Option<thread::JoinHandle<()>>,
    num_batches: usize,
}

impl ChunkLoader {
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for ChunkLoader {
    type Item = Fallible<ChunkBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for ChunkLoader {
    fn drop(&mut self) {
        // disconnect first so a blocked producer wakes up
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("chunk loader thread panicked");
            }
        }
    }
}
