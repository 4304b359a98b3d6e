use super::warp::warp;
use crate::common::*;

/// Builds motion-compensated candidate volumes.
///
/// For every pixel of the current frame the displacement field points at a
/// source location in the previous deblurred frame; the volume stacks the
/// previous frame sampled at each of the `k x k` integer offsets around that
/// location. Offsets are enumerated in row-major order `(dy, dx)` from
/// `(-r, -r)` to `(r, r)` with `r = k / 2`, and the output channels are laid
/// out candidate-major: channel `n * 3 + c` is color `c` of candidate `n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelVolume {
    ksize: i64,
    offsets: Vec<(i64, i64)>,
}

impl PixelVolume {
    pub fn new(ksize: i64) -> Fallible<Self> {
        if ksize <= 0 || ksize % 2 == 0 {
            return Err(DeblurError::configuration(format!(
                "pixel volume window must be a positive odd number, got {}",
                ksize
            ))
            .into());
        }

        let radius = ksize / 2;
        let offsets = iproduct!(-radius..=radius, -radius..=radius).collect();
        Ok(Self { ksize, offsets })
    }

    pub fn ksize(&self) -> i64 {
        self.ksize
    }

    pub fn num_candidates(&self) -> i64 {
        self.ksize * self.ksize
    }

    /// Output channels for frames with `color_channels` channels.
    pub fn channels(&self, color_channels: i64) -> i64 {
        self.num_candidates() * color_channels
    }

    /// Candidate offsets as `(dy, dx)`.
    pub fn offsets(&self) -> &[(i64, i64)] {
        &self.offsets
    }

    /// Returns a `[batch, k * k * 3, height, width]` volume.
    ///
    /// `prev` and `curr` are `[batch, 3, height, width]` and `field` is the
    /// `[batch, 2, height, width]` displacement from `curr` into `prev`,
    /// already corrected to the frame resolution. The result is
    /// differentiable in `prev` and `field`.
    pub fn build(
        &self,
        prev: &Tensor,
        field: &Tensor,
        curr: &Tensor,
        height: i64,
        width: i64,
    ) -> Fallible<Tensor> {
        let (batch, channels) = match prev.size().as_slice() {
            &[b, c, h, w] if h == height && w == width => (b, c),
            size => {
                return Err(DeblurError::dimension(format!(
                    "previous frame {:?} does not match {}x{}",
                    size, height, width
                ))
                .into())
            }
        };
        match curr.size().as_slice() {
            &[b, c, h, w] if b == batch && c == channels && h == height && w == width => (),
            size => {
                return Err(DeblurError::dimension(format!(
                    "current frame {:?} does not match previous frame {:?}",
                    size,
                    prev.size()
                ))
                .into())
            }
        }
        match field.size().as_slice() {
            &[b, 2, h, w] if b == batch && h == height && w == width => (),
            size => {
                return Err(DeblurError::dimension(format!(
                    "displacement field {:?} does not match {}x{} frames",
                    size, height, width
                ))
                .into())
            }
        }

        let num = self.num_candidates();
        let shifts = self
            .offsets
            .iter()
            .flat_map(|&(dy, dx)| [dx as f32, dy as f32])
            .collect::<Vec<_>>();
        let shifts = Tensor::of_slice(&shifts)
            .view([1, num, 2, 1, 1])
            .to_kind(field.kind())
            .to_device(field.device());

        // every candidate becomes its own batch entry, one sampler call
        let fields = (field.unsqueeze(1) + shifts).reshape(&[batch * num, 2, height, width]);
        let sources = prev
            .unsqueeze(1)
            .expand(&[batch, num, channels, height, width], false)
            .reshape(&[batch * num, channels, height, width]);

        let volume = warp(&sources, &fields)?;
        Ok(volume.reshape(&[batch, num * channels, height, width]))
    }
}
