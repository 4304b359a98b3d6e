use super::{
    align::{aligned_size, crop_to, pad_field},
    arch,
    network::{DeblurFn, MotionFn, SubNetwork},
    pixel_volume::PixelVolume,
    warp::{warp, warp_with, WarpPadding},
};
use crate::{common::*, config::ValueRange, params};

/// The four displacement fields supervised by warping ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowVariant {
    /// Blurry current frame to blurry previous frame.
    BlurBlur,
    /// Blurry current frame to sharp previous frame.
    BlurSharp,
    /// Sharp current frame to blurry previous frame.
    SharpBlur,
    /// Sharp current frame to sharp previous frame.
    SharpSharp,
}

impl FlowVariant {
    pub const ALL: [FlowVariant; 4] = [
        Self::BlurBlur,
        Self::BlurSharp,
        Self::SharpBlur,
        Self::SharpSharp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BlurBlur => "bb",
            Self::BlurSharp => "bs",
            Self::SharpBlur => "sb",
            Self::SharpSharp => "ss",
        }
    }
}

/// The previous ground-truth frame warped by one field, with the mask of
/// pixels whose source lies inside the frame.
#[derive(Debug)]
pub struct WarpedImage {
    pub variant: FlowVariant,
    pub image: Tensor,
    pub mask: Tensor,
}

/// Auxiliary warps of the training forward pass.
#[derive(Debug)]
pub struct FlowSupervision {
    pub warps: Vec<WarpedImage>,
    /// The current ground-truth frame in [0, 1], cropped like the warps.
    pub target: Tensor,
}

impl FlowSupervision {
    /// Mean over the variants of `sum((image - target * mask)^2) / sum(mask)`.
    ///
    /// Out-of-frame pixels compare the warped image against zero.
    pub fn loss(&self) -> Tensor {
        let losses = self
            .warps
            .iter()
            .map(|WarpedImage { image, mask, .. }| {
                let diff = image - &self.target * mask;
                (&diff * &diff).sum(Kind::Float) / mask.sum(Kind::Float).clamp_min(1e-8)
            })
            .collect::<Vec<_>>();
        Tensor::stack(&losses, 0).mean(Kind::Float)
    }
}

#[derive(Debug)]
pub struct CompositeInput {
    pub prev: Tensor,
    pub curr: Tensor,
    pub next: Tensor,
    /// The recurrent state, the deblurred estimate of `prev`.
    pub prev_deblurred: Tensor,
    pub gt_prev: Option<Tensor>,
    pub gt_curr: Option<Tensor>,
    /// Requests the `bb` warp of `gt_prev` for visualization.
    pub save_sample: bool,
}

#[derive(Debug)]
pub struct CompositeOutput {
    /// Deblurred estimate of `curr`.
    pub result: Tensor,
    pub pixel_volume: Tensor,
    /// The blur-to-blur field at the frame resolution.
    pub field: Tensor,
    /// Present when training an unfrozen motion network.
    pub flow_supervision: Option<FlowSupervision>,
    /// The `gt_prev` frame warped by the blur-to-blur field, for visualization.
    pub sample_warp: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct CompositeNetworkInit {
    pub pv_ksize: i64,
    pub refine_val: i64,
    pub fix_motion: bool,
    pub value_range: ValueRange,
    pub flow_channels: i64,
    pub deblur_channels: i64,
    pub deblur_res_blocks: usize,
    pub weight_gain: f64,
}

impl Default for CompositeNetworkInit {
    fn default() -> Self {
        Self {
            pv_ksize: params::PV_KSIZE,
            refine_val: params::REFINE_VAL,
            fix_motion: false,
            value_range: ValueRange::Unit,
            flow_channels: params::FLOW_CHANNELS,
            deblur_channels: params::DEBLUR_CHANNELS,
            deblur_res_blocks: params::DEBLUR_RES_BLOCKS,
            weight_gain: params::WEIGHT_INIT_GAIN,
        }
    }
}

impl CompositeNetworkInit {
    /// Builds the network with the baseline sub-networks, registering their
    /// variables under the `motion` and `deblur` namespaces of `path`.
    pub fn build<'p, P>(self, path: P) -> Fallible<CompositeNetwork>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let pixel_volume = PixelVolume::new(self.pv_ksize)?;
        let motion = arch::flow_net(
            SubNetwork::Motion.path(path),
            self.flow_channels,
            self.weight_gain,
        );
        let deblur = arch::pv_deblur_net(
            SubNetwork::Deblur.path(path),
            pixel_volume.channels(3),
            self.deblur_channels,
            self.deblur_res_blocks,
            self.weight_gain,
        );
        self.build_with(motion, deblur)
    }

    /// Builds the network around caller-provided sub-networks.
    pub fn build_with(self, motion: MotionFn, deblur: DeblurFn) -> Fallible<CompositeNetwork> {
        let Self {
            pv_ksize,
            refine_val,
            fix_motion,
            value_range,
            ..
        } = self;

        if refine_val <= 0 {
            return Err(DeblurError::configuration(format!(
                "refine_val must be positive, got {}",
                refine_val
            ))
            .into());
        }

        Ok(CompositeNetwork {
            pixel_volume: PixelVolume::new(pv_ksize)?,
            refine_val,
            fix_motion,
            value_range,
            motion,
            deblur,
        })
    }
}

/// Motion estimation, pixel-volume construction and deblurring of one frame.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CompositeNetwork {
    pixel_volume: PixelVolume,
    refine_val: i64,
    fix_motion: bool,
    value_range: ValueRange,
    #[derivative(Debug = "ignore")]
    motion: MotionFn,
    #[derivative(Debug = "ignore")]
    deblur: DeblurFn,
}

impl CompositeNetwork {
    pub fn pixel_volume(&self) -> &PixelVolume {
        &self.pixel_volume
    }

    pub fn fix_motion(&self) -> bool {
        self.fix_motion
    }

    pub fn value_range(&self) -> ValueRange {
        self.value_range
    }

    pub fn forward_t(&self, input: &CompositeInput, train: bool) -> Fallible<CompositeOutput> {
        let CompositeInput {
            prev,
            curr,
            next,
            prev_deblurred,
            gt_prev,
            gt_curr,
            save_sample,
        } = input;

        let (batch, channels, height, width) = curr.size4().map_err(|_| {
            DeblurError::dimension(format!("expect a 4-D frame, got {:?}", curr.size()))
        })?;
        if channels != 3 {
            return Err(DeblurError::dimension(format!(
                "expect 3 color channels, got {}",
                channels
            ))
            .into());
        }
        for (name, frame) in [("prev", prev), ("next", next), ("prev_deblurred", prev_deblurred)] {
            if frame.size() != curr.size() {
                return Err(DeblurError::dimension(format!(
                    "{} frame {:?} does not match the current frame {:?}",
                    name,
                    frame.size(),
                    curr.size()
                ))
                .into());
            }
        }

        let (crop_h, crop_w) = aligned_size(height, width, self.refine_val);
        if crop_h == 0 || crop_w == 0 {
            return Err(DeblurError::dimension(format!(
                "{}x{} frames are smaller than the alignment multiple {}",
                height, width, self.refine_val
            ))
            .into());
        }
        let crop_norm = |frame: &Tensor| self.value_range.to_unit(&crop_to(frame, crop_h, crop_w));

        let curr_norm = crop_norm(curr);
        let prev_norm = crop_norm(prev);
        let field_bb = self.estimate_motion(&curr_norm, &prev_norm, train, (batch, crop_h, crop_w))?;
        let field = pad_field(&field_bb, height, width)?;

        let pixel_volume = self
            .pixel_volume
            .build(prev_deblurred, &field, curr, height, width)?;
        let result = (self.deblur)(&pixel_volume, prev, curr, next, train);
        if result.size() != curr.size() {
            return Err(DeblurError::dimension(format!(
                "deblurring network produced {:?} for a {:?} frame",
                result.size(),
                curr.size()
            ))
            .into());
        }

        let flow_supervision = if train && !self.fix_motion {
            let (gt_prev, gt_curr) = match (gt_prev, gt_curr) {
                (Some(gt_prev), Some(gt_curr)) => (gt_prev, gt_curr),
                _ => bail!("training the motion network requires gt_prev and gt_curr"),
            };
            let gt_prev_norm = crop_norm(gt_prev);
            let gt_curr_norm = crop_norm(gt_curr);
            let shape = (batch, crop_h, crop_w);

            let field_bs = self.estimate_motion(&curr_norm, &gt_prev_norm, train, shape)?;
            let field_sb = self.estimate_motion(&gt_curr_norm, &prev_norm, train, shape)?;
            let field_ss = self.estimate_motion(&gt_curr_norm, &gt_prev_norm, train, shape)?;
            let fields = [field_bb, field_bs, field_sb, field_ss];

            let ones = gt_prev_norm.ones_like();
            let warps = FlowVariant::ALL
                .iter()
                .zip(fields.iter())
                .map(|(&variant, field)| -> Fallible<WarpedImage> {
                    let image = warp(&gt_prev_norm, field)?;
                    let mask = tch::no_grad(|| {
                        warp_with(&ones, &field.detach(), WarpPadding::Zeros)
                    })?;
                    Ok(WarpedImage {
                        variant,
                        image,
                        mask,
                    })
                })
                .collect::<Fallible<Vec<_>>>()?;

            Some(FlowSupervision {
                warps,
                target: gt_curr_norm,
            })
        } else {
            None
        };

        let sample_warp = match (*save_sample, gt_prev) {
            (true, Some(gt_prev)) => {
                let gt_prev_norm = self.value_range.to_unit(gt_prev);
                Some(tch::no_grad(|| warp(&gt_prev_norm, &field.detach()))?)
            }
            _ => None,
        };

        Ok(CompositeOutput {
            result,
            pixel_volume,
            field,
            flow_supervision,
            sample_warp,
        })
    }

    /// Runs the motion network on aligned [0, 1] frames.
    ///
    /// A coarser field is bilinearly resized to the frame size with its
    /// displacements scaled by the resize ratios.
    fn estimate_motion(
        &self,
        target: &Tensor,
        source: &Tensor,
        train: bool,
        (batch, height, width): (i64, i64, i64),
    ) -> Fallible<Tensor> {
        let field = if self.fix_motion {
            tch::no_grad(|| (self.motion)(target, source, false))
        } else {
            (self.motion)(target, source, train)
        };

        let expect = [batch, 2, height, width];
        let (field_h, field_w) = match field.size().as_slice() {
            &[b, 2, h, w] if b == batch && h > 0 && w > 0 && h <= height && w <= width => (h, w),
            size => {
                return Err(DeblurError::dimension(format!(
                    "motion network produced {:?}, expect at most {:?}",
                    size, expect
                ))
                .into())
            }
        };
        if (field_h, field_w) == (height, width) {
            return Ok(field);
        }

        let scale = Tensor::of_slice(&[
            width as f32 / field_w as f32,
            height as f32 / field_h as f32,
        ])
        .view([1, 2, 1, 1])
        .to_device(field.device());
        let resized = field.upsample_bilinear2d(&[height, width], false, None::<f64>, None::<f64>);
        Ok(resized * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tiny_init(fix_motion: bool) -> CompositeNetworkInit {
        CompositeNetworkInit {
            pv_ksize: 3,
            refine_val: 8,
            fix_motion,
            value_range: ValueRange::Unit,
            flow_channels: 4,
            deblur_channels: 4,
            deblur_res_blocks: 1,
            weight_gain: 1.0,
        }
    }

    fn input(height: i64, width: i64, with_gt: bool) -> CompositeInput {
        let frame = || Tensor::rand(&[2, 3, height, width], (Kind::Float, Device::Cpu));
        CompositeInput {
            prev: frame(),
            curr: frame(),
            next: frame(),
            prev_deblurred: frame(),
            gt_prev: with_gt.then(frame),
            gt_curr: with_gt.then(frame),
            save_sample: false,
        }
    }

    #[test]
    fn all_zero_frames_run_end_to_end() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();

        let zeros = Tensor::zeros(&[1, 3, 20, 27], (Kind::Float, Device::Cpu));
        let input = CompositeInput {
            prev: zeros.shallow_clone(),
            curr: zeros.shallow_clone(),
            next: zeros.shallow_clone(),
            prev_deblurred: zeros.shallow_clone(),
            gt_prev: None,
            gt_curr: None,
            save_sample: false,
        };
        let output = net.forward_t(&input, false).unwrap();
        assert_eq!(output.result.size(), vec![1, 3, 20, 27]);
        assert_eq!(output.pixel_volume.size(), vec![1, 27, 20, 27]);
        assert_eq!(output.field.size(), vec![1, 2, 20, 27]);
        assert!(output.flow_supervision.is_none());
    }

    #[test]
    fn training_produces_four_supervised_warps() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();

        let output = net.forward_t(&input(18, 24, true), true).unwrap();
        let supervision = output.flow_supervision.unwrap();
        let variants = supervision
            .warps
            .iter()
            .map(|warped| warped.variant)
            .collect::<Vec<_>>();
        assert_eq!(variants, FlowVariant::ALL.to_vec());
        for warped in &supervision.warps {
            assert_eq!(warped.image.size(), vec![2, 3, 16, 24]);
            assert!(!warped.mask.requires_grad());
        }
        assert_eq!(supervision.target.size(), vec![2, 3, 16, 24]);

        let loss = supervision.loss();
        assert!(loss.double_value(&[]).is_finite());
        loss.backward();
    }

    #[test]
    fn frozen_motion_skips_supervision() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(true).build(vs.root()).unwrap();
        let output = net.forward_t(&input(16, 16, true), true).unwrap();
        assert!(output.flow_supervision.is_none());
        assert!(!output.field.requires_grad());
    }

    #[test]
    fn training_without_ground_truth_fails() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();
        assert!(net.forward_t(&input(16, 16, false), true).is_err());
    }

    #[test]
    fn sample_warp_is_only_computed_on_request() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();

        let mut input = input(16, 16, true);
        let output = net.forward_t(&input, false).unwrap();
        assert!(output.sample_warp.is_none());
        assert!(output.flow_supervision.is_none());

        input.save_sample = true;
        let output = net.forward_t(&input, false).unwrap();
        assert_eq!(output.sample_warp.unwrap().size(), vec![2, 3, 16, 16]);
    }

    #[test]
    fn frames_below_the_alignment_multiple_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();
        let err = net.forward_t(&input(6, 16, false), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeblurError>(),
            Some(DeblurError::Dimension(_))
        ));
    }

    #[test]
    fn wrong_field_shape_is_a_dimension_error() {
        let deblur = || -> DeblurFn { Box::new(|_volume, _prev, curr, _next, _train| curr.shallow_clone()) };
        let motions: Vec<MotionFn> = vec![
            Box::new(|target, _source, _train| target.narrow(1, 0, 1)),
            Box::new(|target, _source, _train| target.narrow(1, 0, 2).repeat(&[1, 1, 2, 1])),
        ];
        for motion in motions {
            let net = tiny_init(false).build_with(motion, deblur()).unwrap();
            let err = net.forward_t(&input(16, 16, false), false).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DeblurError>(),
                Some(DeblurError::Dimension(_))
            ));
        }
    }

    #[test]
    fn coarse_field_is_resized_and_rescaled() {
        let motion: MotionFn = Box::new(|target, _source, _train| {
            let (batch, _, height, width) = target.size4().unwrap();
            let opts = (Kind::Float, target.device());
            let dx = Tensor::ones(&[batch, 1, height / 2, width / 2], opts);
            let dy = Tensor::ones(&[batch, 1, height / 2, width / 2], opts) * 0.5;
            Tensor::cat(&[dx, dy], 1)
        });
        let deblur: DeblurFn = Box::new(|_volume, _prev, curr, _next, _train| curr.shallow_clone());
        let net = tiny_init(true).build_with(motion, deblur).unwrap();

        // 16x20 frames crop to 16x16 for the motion network
        let output = net.forward_t(&input(16, 20, false), false).unwrap();
        assert_eq!(output.field.size(), vec![2, 2, 16, 20]);

        let inside = output.field.narrow(3, 0, 16);
        let dx = inside.select(1, 0);
        let dy = inside.select(1, 1);
        assert!((dx - 2.0).abs().max().double_value(&[]) < 1e-5);
        assert!((dy - 1.0).abs().max().double_value(&[]) < 1e-5);
        assert_eq!(output.field.narrow(3, 16, 4).abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn flow_loss_compares_warps_against_the_masked_target() {
        let opts = (Kind::Float, Device::Cpu);
        let image = Tensor::ones(&[1, 3, 4, 4], opts) * 0.5;
        // left half of the frame is in view
        let mask = Tensor::cat(
            &[Tensor::ones(&[1, 3, 4, 2], opts), Tensor::zeros(&[1, 3, 4, 2], opts)],
            3,
        );
        let supervision = FlowSupervision {
            warps: FlowVariant::ALL
                .iter()
                .map(|&variant| WarpedImage {
                    variant,
                    image: image.shallow_clone(),
                    mask: mask.shallow_clone(),
                })
                .collect(),
            target: Tensor::zeros(&[1, 3, 4, 4], opts),
        };
        // 0.25 * 48 / 24
        assert_abs_diff_eq!(supervision.loss().double_value(&[]), 0.5, epsilon = 1e-6);

        let target = Tensor::ones(&[1, 3, 4, 4], opts);
        let supervision = FlowSupervision {
            target,
            ..supervision
        };
        // in view: (0.5 - 1)^2, out of view: 0.5^2
        assert_abs_diff_eq!(supervision.loss().double_value(&[]), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn sample_warp_is_available_while_training() {
        let vs = VarStore::new(Device::Cpu);
        let net = tiny_init(false).build(vs.root()).unwrap();
        let mut input = input(16, 16, true);
        input.save_sample = true;
        let output = net.forward_t(&input, true).unwrap();
        let warped = output.sample_warp.unwrap();
        assert_eq!(warped.size(), vec![2, 3, 16, 16]);
        assert!(!warped.requires_grad());
    }
}
