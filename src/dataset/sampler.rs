use super::{
    frame::read_frame,
    index::{ChunkIndex, FrameIndex, SamplingMode},
    sequence::VideoSequence,
};
use crate::{common::*, config::ValueRange};

/// One chunk of stacked frames, `[time, channel, height, width]` each.
#[derive(Debug, TensorLike)]
pub struct Sample {
    pub input: Tensor,
    pub gt: Tensor,
    #[tensor_like(clone)]
    pub chunk: ChunkIndex,
    /// Set when the chunk opens a new video; the recurrent state is reset there.
    #[tensor_like(clone)]
    pub is_first: bool,
}

/// Gaussian perturbation of the first input frame of a training window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseAugment {
    pub prob: f64,
    pub std: f64,
}

#[derive(Debug, Clone)]
pub struct SequenceSamplerInit {
    pub mode: SamplingMode,
    pub frame_num: usize,
    pub chunk_len: usize,
    /// Random crop `(height, width)`, shared by all frames of a sample.
    pub crop: Option<(usize, usize)>,
    pub noise: Option<NoiseAugment>,
    pub norm_val: f64,
    pub value_range: ValueRange,
}

impl SequenceSamplerInit {
    pub fn build(self, videos: Vec<VideoSequence>) -> Fallible<SequenceSampler> {
        let Self {
            mode,
            frame_num,
            chunk_len,
            crop,
            noise,
            norm_val,
            value_range,
        } = self;

        if frame_num == 0 || frame_num % 2 == 0 {
            return Err(DeblurError::configuration(format!(
                "frame_num must be a positive odd number, got {}",
                frame_num
            ))
            .into());
        }
        if let Some((height, width)) = crop {
            if height == 0 || width == 0 {
                return Err(DeblurError::configuration("crop size must be positive").into());
            }
        }
        if let Some(video) = videos.iter().find(|video| !video.has_gt()) {
            return Err(DeblurError::configuration(format!(
                "video {} has no ground truth and cannot be sampled",
                video.name
            ))
            .into());
        }

        let frame_counts = videos.iter().map(|video| video.len()).collect::<Vec<_>>();
        let index = FrameIndex::build(&frame_counts, chunk_len, mode)?;

        Ok(SequenceSampler {
            videos,
            index,
            frame_num,
            crop,
            noise,
            norm_val,
            value_range,
        })
    }
}

/// Maps global indices to frame windows and materializes them.
///
/// Sampling only reads files, so a sampler can be shared across loader
/// threads.
#[derive(Debug)]
pub struct SequenceSampler {
    videos: Vec<VideoSequence>,
    index: FrameIndex,
    frame_num: usize,
    crop: Option<(usize, usize)>,
    noise: Option<NoiseAugment>,
    norm_val: f64,
    value_range: ValueRange,
}

impl SequenceSampler {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn videos(&self) -> &[VideoSequence] {
        &self.videos
    }

    pub fn mode(&self) -> SamplingMode {
        self.index.mode()
    }

    /// The number of raw frames in one sample.
    pub fn window_len(&self) -> usize {
        self.frame_num - 1 + self.index.chunk_len()
    }

    /// Resolves `index` to its chunk and the clamped frame positions it covers.
    ///
    /// The window is centered on the chunk start; positions before the first
    /// or after the last frame repeat the edge frame.
    pub fn window(&self, index: usize) -> Fallible<(ChunkIndex, Vec<usize>)> {
        let chunk = self.index.get(index).ok_or_else(|| {
            format_err!(
                "sample index {} out of range, the dataset has {} chunks",
                index,
                self.len()
            )
        })?;
        let total = self.videos[chunk.video_id].len();
        let frames = clamped_window(chunk.offset, self.frame_num, self.window_len(), total);
        Ok((chunk, frames))
    }

    /// Loads the sample at global `index`.
    pub fn sample<R>(&self, index: usize, rng: &mut R) -> Fallible<Sample>
    where
        R: Rng,
    {
        let (chunk, frames) = self.window(index)?;
        let video = &self.videos[chunk.video_id];

        for &frame in &frames {
            video.verify_pair(frame)?;
        }

        let pairs = frames
            .par_iter()
            .map(|&frame| -> Fallible<(Tensor, Tensor)> {
                let input = read_frame(&video.input_frames[frame], self.norm_val, self.value_range)?;
                let gt = read_frame(&video.gt_frames[frame], self.norm_val, self.value_range)?;
                Ok((input, gt))
            })
            .collect::<Fallible<Vec<_>>>()?;
        let (mut inputs, gts): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();

        let size = inputs[0].size();
        if let Some(frame) = inputs.iter().chain(gts.iter()).find(|frame| frame.size() != size) {
            return Err(DeblurError::dimension(format!(
                "frames of video {} differ in size: {:?} and {:?}",
                video.name,
                size,
                frame.size()
            ))
            .into());
        }

        if let Some(NoiseAugment { prob, std }) = self.noise {
            if rng.gen_bool(prob) {
                let (lower, upper) = self.value_range.bounds();
                let first = &inputs[0];
                inputs[0] = (first + first.randn_like() * std)
                    .clamp_min(lower)
                    .clamp_max(upper);
            }
        }

        let input = Tensor::stack(&inputs, 0);
        let gt = Tensor::stack(&gts, 0);

        let (input, gt) = match self.crop {
            Some((crop_h, crop_w)) => {
                let (height, width) = (size[1] as usize, size[2] as usize);
                if height < crop_h || width < crop_w {
                    return Err(DeblurError::dimension(format!(
                        "video {} frames are {}x{}, smaller than the crop {}x{}",
                        video.name, height, width, crop_h, crop_w
                    ))
                    .into());
                }
                let top = rng.gen_range(0..=(height - crop_h)) as i64;
                let left = rng.gen_range(0..=(width - crop_w)) as i64;
                let crop = |stack: &Tensor| {
                    stack
                        .narrow(2, top, crop_h as i64)
                        .narrow(3, left, crop_w as i64)
                        .contiguous()
                };
                (crop(&input), crop(&gt))
            }
            None => (input, gt),
        };

        Ok(Sample {
            input,
            gt,
            chunk,
            is_first: self.index.is_first(index),
        })
    }
}

/// Frame positions `offset - frame_num / 2 ..` of length `window_len`,
/// clamped to `[0, total - 1]`.
pub fn clamped_window(
    offset: usize,
    frame_num: usize,
    window_len: usize,
    total: usize,
) -> Vec<usize> {
    let last = total.saturating_sub(1) as isize;
    let start = offset as isize - (frame_num / 2) as isize;
    (start..(start + window_len as isize))
        .map(|pos| pos.clamp(0, last) as usize)
        .collect()
}
