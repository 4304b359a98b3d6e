//! Image quality measures over [0, 1] frames.
//!
//! All functions accept `[3, h, w]` or `[batch, 3, h, w]` tensors and average
//! over every element, including the batch.

use crate::{common::*, params};

fn as_batch(name: &str, image: &Tensor) -> Fallible<Tensor> {
    match image.dim() {
        3 => Ok(image.unsqueeze(0)),
        4 => Ok(image.shallow_clone()),
        dim => Err(DeblurError::dimension(format!(
            "{} must be 3 or 4 dimensional, got {} dimensions",
            name, dim
        ))
        .into()),
    }
}

fn check_pair(output: &Tensor, gt: &Tensor) -> Fallible<(Tensor, Tensor)> {
    let output = as_batch("output", output)?;
    let gt = as_batch("ground truth", gt)?;
    if output.size() != gt.size() {
        return Err(DeblurError::dimension(format!(
            "cannot compare {:?} with {:?}",
            output.size(),
            gt.size()
        ))
        .into());
    }
    Ok((
        output.to_kind(Kind::Double),
        gt.to_kind(Kind::Double).to_device(output.device()),
    ))
}

/// Peak signal-to-noise ratio in dB, capped at 100 dB for identical images.
pub fn psnr(output: &Tensor, gt: &Tensor) -> Fallible<f64> {
    let (output, gt) = check_pair(output, gt)?;
    let diff = output - gt;
    let mse = (&diff * &diff)
        .mean(Kind::Double)
        .double_value(&[])
        .max(params::PSNR_MIN_MSE);
    Ok(-10.0 * mse.log10())
}

/// Mean absolute error.
pub fn mae(output: &Tensor, gt: &Tensor) -> Fallible<f64> {
    let (output, gt) = check_pair(output, gt)?;
    Ok((output - gt).abs().mean(Kind::Double).double_value(&[]))
}

/// Structural similarity with an 11x11 Gaussian window (sigma 1.5).
///
/// The window is applied per channel without padding, so both sides must be
/// at least as large as the window.
pub fn ssim(output: &Tensor, gt: &Tensor) -> Fallible<f64> {
    let (output, gt) = check_pair(output, gt)?;
    let (_, channels, height, width) = output.size4()?;
    let size = params::SSIM_WINDOW;
    if height < size || width < size {
        return Err(DeblurError::dimension(format!(
            "{}x{} images are smaller than the {}x{} SSIM window",
            height, width, size, size
        ))
        .into());
    }

    let window = gaussian_window(size, params::SSIM_SIGMA)
        .to_device(output.device())
        .expand(&[channels, 1, size, size], false)
        .contiguous();
    let filter = |xs: &Tensor| xs.conv2d(&window, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], channels);

    let c1 = 0.01_f64 * 0.01;
    let c2 = 0.03_f64 * 0.03;

    let mu_x = filter(&output);
    let mu_y = filter(&gt);
    let mu_xx = &mu_x * &mu_x;
    let mu_yy = &mu_y * &mu_y;
    let mu_xy = &mu_x * &mu_y;
    let sigma_xx = filter(&(&output * &output)) - &mu_xx;
    let sigma_yy = filter(&(&gt * &gt)) - &mu_yy;
    let sigma_xy = filter(&(&output * &gt)) - &mu_xy;

    let numer = (mu_xy * 2.0 + c1) * (sigma_xy * 2.0 + c2);
    let denom = (mu_xx + mu_yy + c1) * (sigma_xx + sigma_yy + c2);
    Ok((numer / denom).mean(Kind::Double).double_value(&[]))
}

/// A normalized `[1, 1, size, size]` Gaussian kernel.
fn gaussian_window(size: i64, sigma: f64) -> Tensor {
    let center = (size / 2) as f64;
    let weights = (0..size)
        .map(|index| {
            let dist = index as f64 - center;
            (-(dist * dist) / (2.0 * sigma * sigma)).exp()
        })
        .collect::<Vec<_>>();
    let total: f64 = weights.iter().sum();
    let line = Tensor::of_slice(&weights) / total;
    line.view([size, 1])
        .matmul(&line.view([1, size]))
        .view([1, 1, size, size])
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityScores {
    pub psnr: f64,
    pub ssim: f64,
    pub mae: f64,
}

impl QualityScores {
    pub fn measure(output: &Tensor, gt: &Tensor) -> Fallible<Self> {
        Ok(Self {
            psnr: psnr(output, gt)?,
            ssim: ssim(output, gt)?,
            mae: mae(output, gt)?,
        })
    }

    /// The element-wise mean, `None` for no scores.
    pub fn mean<'a, I>(scores: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        let (count, total) = scores.into_iter().fold(
            (0_usize, Self::default()),
            |(count, total), score| {
                let total = Self {
                    psnr: total.psnr + score.psnr,
                    ssim: total.ssim + score.ssim,
                    mae: total.mae + score.mae,
                };
                (count + 1, total)
            },
        );

        (count > 0).then(|| Self {
            psnr: total.psnr / count as f64,
            ssim: total.ssim / count as f64,
            mae: total.mae / count as f64,
        })
    }
}

impl std::fmt::Display for QualityScores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "psnr: {:.4}\tssim: {:.4}\tmae: {:.5}",
            self.psnr, self.ssim, self.mae
        )
    }
}
