mod frame;
mod index;
mod loader;
mod partition;
mod sampler;
mod sequence;

pub use frame::{read_frame, save_frame};
pub use index::{ChunkIndex, FrameIndex, SamplingMode};
pub use loader::{ChunkBatch, ChunkLoader, ChunkLoaderInit};
pub use partition::{video_partition, DistIndexSampler};
pub use sampler::{clamped_window, NoiseAugment, Sample, SequenceSampler, SequenceSamplerInit};
pub use sequence::{load_split, VideoSequence};
