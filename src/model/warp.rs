use crate::common::*;

// grid_sampler modes
const BILINEAR: i64 = 0;
const PAD_ZEROS: i64 = 0;
const PAD_BORDER: i64 = 1;

/// What a sample that falls outside the image reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpPadding {
    /// The nearest edge pixel.
    Border,
    /// Zero, used for validity masks.
    Zeros,
}

/// Resamples `image` at every pixel position displaced by `field`.
///
/// `image` is `[batch, channels, height, width]` and `field` is
/// `[batch, 2, height, width]` holding `(dx, dy)` in pixels. Sampling is
/// bilinear and differentiable in both arguments; out-of-bounds samples
/// replicate the border.
pub fn warp(image: &Tensor, field: &Tensor) -> Fallible<Tensor> {
    warp_with(image, field, WarpPadding::Border)
}

pub fn warp_with(image: &Tensor, field: &Tensor, padding: WarpPadding) -> Fallible<Tensor> {
    let (batch, _channels, height, width) = image.size4().map_err(|_| {
        DeblurError::dimension(format!("expect a 4-D image, got {:?}", image.size()))
    })?;
    match field.size().as_slice() {
        &[b, 2, h, w] if b == batch && h == height && w == width => (),
        size => {
            return Err(DeblurError::dimension(format!(
                "displacement field {:?} does not match image {:?}",
                size,
                image.size()
            ))
            .into())
        }
    }

    let grid = sampling_grid(field, height, width);
    let padding_mode = match padding {
        WarpPadding::Border => PAD_BORDER,
        WarpPadding::Zeros => PAD_ZEROS,
    };
    Ok(image.grid_sampler(&grid, BILINEAR, padding_mode, true))
}

/// Converts a pixel displacement field into the `[batch, height, width, 2]`
/// normalized grid expected by `grid_sampler` with aligned corners.
fn sampling_grid(field: &Tensor, height: i64, width: i64) -> Tensor {
    let device = field.device();
    let kind = field.kind();

    let xs = Tensor::arange(width, (kind, device)).view([1, 1, 1, width]);
    let ys = Tensor::arange(height, (kind, device)).view([1, 1, height, 1]);

    let x = field.narrow(1, 0, 1) + xs;
    let y = field.narrow(1, 1, 1) + ys;

    let x = x * (2.0 / (width - 1).max(1) as f64) - 1.0;
    let y = y * (2.0 / (height - 1).max(1) as f64) - 1.0;

    Tensor::cat(&[x, y], 1).permute(&[0, 2, 3, 1])
}
