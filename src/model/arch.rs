use super::network::{DeblurFn, MotionFn};
use crate::common::*;

/// Xavier uniform weights for a kernel connecting `in_channels` to
/// `out_channels`.
fn xavier_uniform(in_channels: i64, out_channels: i64, ksize: i64, gain: f64) -> nn::Init {
    let fan_sum = ((in_channels + out_channels) * ksize * ksize) as f64;
    let bound = gain * (6.0 / fan_sum).sqrt();
    nn::Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

fn conv<'p>(
    path: nn::Path<'p>,
    in_channels: i64,
    out_channels: i64,
    stride: i64,
    gain: f64,
) -> nn::Conv2D {
    let config = ConvConfig {
        padding: 1,
        stride,
        ws_init: xavier_uniform(in_channels, out_channels, 3, gain),
        bs_init: nn::Init::Const(0.0),
        ..Default::default()
    };
    nn::conv2d(path, in_channels, out_channels, 3, config)
}

/// A small encoder-decoder estimating displacement fields.
///
/// Inputs must have a height and width divisible by 8.
pub fn flow_net<'p, P>(path: P, channels: i64, gain: f64) -> MotionFn
where
    P: Borrow<nn::Path<'p>>,
{
    let path = path.borrow();
    let up = |name: &str, in_channels: i64, out_channels: i64| {
        let config = ConvTransposeConfig {
            stride: 2,
            padding: 1,
            ws_init: xavier_uniform(in_channels, out_channels, 4, gain),
            bs_init: nn::Init::Const(0.0),
            ..Default::default()
        };
        nn::conv_transpose2d(path / name, in_channels, out_channels, 4, config)
    };

    let conv0 = conv(path / "conv0", 6, channels, 1, gain);
    let conv1 = conv(path / "conv1", channels, channels, 2, gain);
    let conv2 = conv(path / "conv2", channels, channels * 2, 2, gain);
    let conv3 = conv(path / "conv3", channels * 2, channels * 2, 2, gain);
    let up3 = up("up3", channels * 2, channels * 2);
    let up2 = up("up2", channels * 2, channels);
    let up1 = up("up1", channels, channels);
    let head = conv(path / "head", channels, 2, 1, gain);

    Box::new(move |target, source, _train| {
        let xs = Tensor::cat(&[target, source], 1);

        let enc0 = xs.apply(&conv0).relu();
        let enc1 = enc0.apply(&conv1).relu();
        let enc2 = enc1.apply(&conv2).relu();
        let enc3 = enc2.apply(&conv3).relu();

        // decoder with additive skips
        let dec2 = enc3.apply(&up3).relu() + enc2;
        let dec1 = dec2.apply(&up2).relu() + enc1;
        let dec0 = dec1.apply(&up1).relu() + enc0;

        dec0.apply(&head)
    })
}

fn residual_block<'p, P>(path: P, channels: i64, gain: f64) -> impl Fn(&Tensor) -> Tensor + Send + 'static
where
    P: Borrow<nn::Path<'p>>,
{
    let path = path.borrow();
    let conv1 = conv(path / "conv1", channels, channels, 1, gain);
    let conv2 = conv(path / "conv2", channels, channels, 1, gain);

    move |xs| {
        let skip = xs.shallow_clone();
        xs.apply(&conv1).relu().apply(&conv2) + skip
    }
}

/// A residual deblurring network over the pixel volume and the frame triplet.
///
/// The output is added to the current frame.
pub fn pv_deblur_net<'p, P>(
    path: P,
    volume_channels: i64,
    channels: i64,
    num_blocks: usize,
    gain: f64,
) -> DeblurFn
where
    P: Borrow<nn::Path<'p>>,
{
    let path = path.borrow();
    let in_channels = volume_channels + 9;

    let head = conv(path / "head", in_channels, channels, 1, gain);
    let blocks = (0..num_blocks)
        .map(|index| residual_block(path / format!("block{}", index), channels, gain))
        .collect::<Vec<_>>();
    let tail = conv(path / "tail", channels, 3, 1, gain);

    Box::new(move |volume, prev, curr, next, _train| {
        let xs = Tensor::cat(&[volume, prev, curr, next], 1);
        let features = blocks
            .iter()
            .fold(xs.apply(&head).relu(), |features, block| block(&features));
        features.apply(&tail) + curr
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_net_keeps_resolution() {
        let vs = VarStore::new(Device::Cpu);
        let net = flow_net(&vs.root() / "motion", 4, 1.0);
        let frames = Tensor::rand(&[2, 3, 32, 64], (Kind::Float, Device::Cpu));
        let field = net(&frames, &frames, false);
        assert_eq!(field.size(), vec![2, 2, 32, 64]);
    }

    #[test]
    fn deblur_net_matches_current_frame() {
        let vs = VarStore::new(Device::Cpu);
        let net = pv_deblur_net(&vs.root() / "deblur", 27, 8, 2, 1.0);
        let opts = (Kind::Float, Device::Cpu);
        let volume = Tensor::rand(&[1, 27, 10, 12], opts);
        let frame = Tensor::rand(&[1, 3, 10, 12], opts);
        let result = net(&volume, &frame, &frame, &frame, true);
        assert_eq!(result.size(), frame.size());
    }

    #[test]
    fn deblur_net_registers_every_block() {
        let vs = VarStore::new(Device::Cpu);
        let _net = pv_deblur_net(&vs.root() / "deblur", 27, 8, 3, 1.0);
        let names = vs.variables();
        assert!(names.contains_key("deblur.block2.conv2.weight"));
        assert!(!names.contains_key("deblur.block3.conv1.weight"));
    }

    #[test]
    fn weights_follow_xavier_bounds_with_zero_bias() {
        let vs = VarStore::new(Device::Cpu);
        let _net = pv_deblur_net(&vs.root() / "deblur", 27, 8, 1, 0.5);
        let variables = vs.variables();

        // head: 36 -> 8 channels, 3x3 kernel
        let bound = 0.5 * (6.0 / ((36 + 8) * 9) as f64).sqrt();
        let head = &variables["deblur.head.weight"];
        assert!(head.abs().max().double_value(&[]) <= bound);
        assert!(head.abs().max().double_value(&[]) > 0.0);

        for (name, var) in &variables {
            if name.ends_with(".bias") {
                assert_eq!(var.abs().max().double_value(&[]), 0.0, "{}", name);
            }
        }
    }
}
