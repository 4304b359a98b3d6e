use crate::common::*;

/// Whether chunks tile a video (training) or start at every frame (evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingMode {
    Train,
    Eval,
}

/// A contiguous run of frames starting at `offset` in video `video_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkIndex {
    pub video_id: usize,
    pub offset: usize,
}

/// The flat table of chunk start positions over all videos.
#[derive(Debug, Clone)]
pub struct FrameIndex {
    mode: SamplingMode,
    chunk_len: usize,
    chunks: Vec<ChunkIndex>,
}

impl FrameIndex {
    /// Enumerates chunk offsets for videos with the given frame counts.
    ///
    /// Training offsets are `0, L, 2L, ...` and the trailing remainder is
    /// dropped. Evaluation offsets are `0 ..= T - L`.
    pub fn build(frame_counts: &[usize], chunk_len: usize, mode: SamplingMode) -> Fallible<Self> {
        if chunk_len == 0 {
            return Err(DeblurError::configuration("chunk length must be positive").into());
        }

        let step = match mode {
            SamplingMode::Train => chunk_len,
            SamplingMode::Eval => 1,
        };

        let mut chunks = vec![];
        for (video_id, &total) in frame_counts.iter().enumerate() {
            if total < chunk_len {
                return Err(DeblurError::configuration(format!(
                    "video {} has {} frames, fewer than the chunk length {}",
                    video_id, total, chunk_len
                ))
                .into());
            }

            let last = total - chunk_len;
            chunks.extend(
                (0..=last)
                    .step_by(step)
                    .map(|offset| ChunkIndex { video_id, offset }),
            );
        }

        Ok(Self {
            mode,
            chunk_len,
            chunks,
        })
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ChunkIndex> {
        self.chunks.get(index).copied()
    }

    pub fn chunks(&self) -> &[ChunkIndex] {
        &self.chunks
    }

    /// True when the chunk at `index` opens a new video.
    pub fn is_first(&self, index: usize) -> bool {
        match index {
            0 => true,
            _ => match (self.chunks.get(index - 1), self.chunks.get(index)) {
                (Some(prev), Some(curr)) => prev.video_id != curr.video_id,
                _ => true,
            },
        }
    }

    /// Global indices of the chunks of each video, in order.
    pub fn indices_by_video(&self) -> Vec<Vec<usize>> {
        self.chunks
            .iter()
            .enumerate()
            .group_by(|(_, chunk)| chunk.video_id)
            .into_iter()
            .map(|(_, group)| group.map(|(index, _)| index).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(index: &FrameIndex) -> Vec<(usize, usize)> {
        index
            .chunks()
            .iter()
            .map(|chunk| (chunk.video_id, chunk.offset))
            .collect()
    }

    #[test]
    fn train_mode_tiles_videos_and_drops_remainder() {
        let index = FrameIndex::build(&[5, 7], 3, SamplingMode::Train).unwrap();
        assert_eq!(offsets(&index), vec![(0, 0), (1, 0), (1, 3)]);
    }

    #[test]
    fn train_mode_yields_floor_t_over_l_chunks() {
        for total in 3..40 {
            for chunk_len in 1..=total {
                let index = FrameIndex::build(&[total], chunk_len, SamplingMode::Train).unwrap();
                assert_eq!(index.len(), total / chunk_len);
                for (n, chunk) in index.chunks().iter().enumerate() {
                    assert_eq!(chunk.offset, n * chunk_len);
                }
            }
        }
    }

    #[test]
    fn eval_mode_starts_at_every_frame() {
        let index = FrameIndex::build(&[5], 3, SamplingMode::Eval).unwrap();
        assert_eq!(offsets(&index), vec![(0, 0), (0, 1), (0, 2)]);

        let index = FrameIndex::build(&[5, 2], 1, SamplingMode::Eval).unwrap();
        assert_eq!(index.len(), 7);
    }

    #[test]
    fn short_video_is_a_configuration_error() {
        let err = FrameIndex::build(&[5, 2], 3, SamplingMode::Train).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeblurError>(),
            Some(DeblurError::Configuration(_))
        ));
    }

    #[test]
    fn is_first_marks_video_boundaries() {
        let index = FrameIndex::build(&[5, 7], 3, SamplingMode::Train).unwrap();
        assert!(index.is_first(0));
        assert!(index.is_first(1));
        assert!(!index.is_first(2));

        let index = FrameIndex::build(&[3, 3], 1, SamplingMode::Eval).unwrap();
        let flags = (0..index.len()).map(|i| index.is_first(i)).collect::<Vec<_>>();
        assert_eq!(flags, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn groups_indices_by_video() {
        let index = FrameIndex::build(&[2, 3], 1, SamplingMode::Eval).unwrap();
        assert_eq!(index.indices_by_video(), vec![vec![0, 1], vec![2, 3, 4]]);
    }
}
