use super::{
    state::{LossAccumulator, RecurrentState},
    update::ParameterUpdate,
};
use crate::{
    common::*,
    dataset::ChunkBatch,
    metrics,
    model::{CompositeInput, CompositeNetwork},
};

/// The losses of one training chunk, normalized over its steps.
#[derive(Debug)]
pub struct TrainChunkReport {
    pub losses: LossAccumulator,
    pub num_steps: usize,
    pub grad_norm: f64,
    pub last_frames: Option<SampleFrames>,
}

/// The frames of one step kept for inspection, all in [0, 1].
#[derive(Debug)]
pub struct SampleFrames {
    pub input: Tensor,
    pub result: Tensor,
    pub gt: Tensor,
    /// The previous ground-truth frame warped by the blur-to-blur field.
    pub warped: Option<Tensor>,
}

/// One evaluated step.
#[derive(Debug)]
pub struct EvalStep {
    /// The blurry input frame, in [0, 1].
    pub input: Tensor,
    /// The deblurred frame, in [0, 1].
    pub result: Tensor,
    /// The ground-truth frame, in [0, 1].
    pub gt: Option<Tensor>,
    /// The previous ground-truth frame warped by the blur-to-blur field.
    pub sample_warp: Option<Tensor>,
}

/// Drives chunks of frames through the composite network one step at a time.
///
/// A loop owns the recurrent state of the single stream it processes. Step
/// `i` of a chunk uses frames `i`, `i + 1` and `i + 2` as the previous,
/// current and next frame, so a chunk of `n` frames runs `n - 2` steps.
#[derive(Debug)]
pub struct StepLoop<'a> {
    net: &'a CompositeNetwork,
    state: RecurrentState,
    save_sample: bool,
}

impl<'a> StepLoop<'a> {
    pub fn new(net: &'a CompositeNetwork) -> Self {
        Self {
            net,
            state: RecurrentState::new(),
            save_sample: false,
        }
    }

    /// Also produces the `bb` warp of the previous ground truth, on the last
    /// step of a training chunk and on every evaluated step.
    pub fn save_sample(mut self, enabled: bool) -> Self {
        self.save_sample = enabled;
        self
    }

    pub fn state(&self) -> &RecurrentState {
        &self.state
    }

    /// Trains on one batch of chunks with one parameter update per step.
    ///
    /// The state always starts from the first frame of the chunk.
    pub fn train_chunk<U>(&mut self, batch: &ChunkBatch, updater: &mut U) -> Fallible<TrainChunkReport>
    where
        U: ParameterUpdate + ?Sized,
    {
        let num_steps = num_steps(&batch.input)?;
        let weight = batch.batch_size() as f64;
        let value_range = self.net.value_range();
        let frame = |stack: &Tensor, index: usize| stack.select(1, index as i64);

        self.state.reset(&frame(&batch.input, 0));

        let mut losses = LossAccumulator::new();
        let mut grad_norm = 0.0;
        let mut last_frames = None;

        for step in 0..num_steps {
            let is_last = step + 1 == num_steps;
            let gt_curr = frame(&batch.gt, step + 1);
            let input = CompositeInput {
                prev: frame(&batch.input, step),
                curr: frame(&batch.input, step + 1),
                next: frame(&batch.input, step + 2),
                prev_deblurred: self.state.get().map(Tensor::shallow_clone).ok_or_else(|| {
                    format_err!("recurrent state is unset inside a chunk")
                })?,
                gt_prev: Some(frame(&batch.gt, step)),
                gt_curr: Some(gt_curr.shallow_clone()),
                save_sample: self.save_sample && is_last,
            };
            let output = self.net.forward_t(&input, true)?;

            let image_loss = output.result.mse_loss(&gt_curr, Reduction::Mean);
            let flow_loss = output.flow_supervision.as_ref().map(|sup| sup.loss());
            let total_loss = match &flow_loss {
                Some(flow_loss) => &image_loss + flow_loss,
                None => image_loss.shallow_clone(),
            };

            grad_norm = updater.update(&total_loss)?;

            losses.add("image", image_loss.double_value(&[]), weight);
            if let Some(flow_loss) = &flow_loss {
                losses.add("flow", flow_loss.double_value(&[]), weight);
            }
            losses.add("total", total_loss.double_value(&[]), weight);

            self.state.advance(&output.result);

            if is_last {
                last_frames = Some(SampleFrames {
                    input: value_range.to_unit(&input.curr),
                    result: value_range.to_unit(&output.result.detach()),
                    gt: value_range.to_unit(&gt_curr),
                    warped: output.sample_warp,
                });
            }
        }

        Ok(TrainChunkReport {
            losses,
            num_steps,
            grad_norm,
            last_frames,
        })
    }

    /// Evaluates one chunk of a batch-size-one stream and accumulates PSNR.
    ///
    /// The state is reset when the chunk opens a video and carried over
    /// from the previous chunk otherwise.
    pub fn eval_chunk(&mut self, batch: &ChunkBatch) -> Fallible<(LossAccumulator, Vec<EvalStep>)> {
        ensure!(
            batch.batch_size() == 1 && batch.is_first.len() == 1,
            "evaluation runs one stream at a time, got a batch of {}",
            batch.batch_size()
        );

        let steps = self.infer(&batch.input, Some(&batch.gt), batch.is_first[0])?;
        let mut scores = LossAccumulator::new();
        for step in &steps {
            if let Some(gt) = &step.gt {
                scores.add("psnr", metrics::psnr(&step.result, gt)?, 1.0);
            }
        }
        Ok((scores, steps))
    }

    /// Runs a `[batch, frames, 3, h, w]` window forward without gradients.
    pub fn infer(
        &mut self,
        frames: &Tensor,
        gt: Option<&Tensor>,
        is_first: bool,
    ) -> Fallible<Vec<EvalStep>> {
        let num_steps = num_steps(frames)?;
        if let Some(gt) = gt {
            if gt.size() != frames.size() {
                return Err(DeblurError::dimension(format!(
                    "ground truth {:?} does not match input {:?}",
                    gt.size(),
                    frames.size()
                ))
                .into());
            }
        }
        let value_range = self.net.value_range();
        let frame = |stack: &Tensor, index: usize| stack.select(1, index as i64);

        if is_first {
            self.state.reset(&frame(frames, 0));
        } else if !self.state.is_set() {
            bail!("a continuing chunk arrived before the first chunk of its video");
        }

        tch::no_grad(|| {
            (0..num_steps)
                .map(|step| -> Fallible<EvalStep> {
                    let prev_deblurred = self
                        .state
                        .get()
                        .map(Tensor::shallow_clone)
                        .ok_or_else(|| format_err!("recurrent state is unset"))?;
                    let input = CompositeInput {
                        prev: frame(frames, step),
                        curr: frame(frames, step + 1),
                        next: frame(frames, step + 2),
                        prev_deblurred,
                        gt_prev: gt.map(|gt| frame(gt, step)),
                        gt_curr: gt.map(|gt| frame(gt, step + 1)),
                        save_sample: self.save_sample,
                    };
                    let output = self.net.forward_t(&input, false)?;
                    self.state.advance(&output.result);

                    Ok(EvalStep {
                        input: value_range.to_unit(&input.curr),
                        result: value_range.to_unit(&output.result),
                        gt: input.gt_curr.as_ref().map(|gt| value_range.to_unit(gt)),
                        sample_warp: output.sample_warp,
                    })
                })
                .collect()
        })
    }
}

fn num_steps(frames: &Tensor) -> Fallible<usize> {
    let size = frames.size();
    match size.as_slice() {
        &[_, time, 3, _, _] if time >= 3 => Ok(time as usize - 2),
        _ => Err(DeblurError::dimension(format!(
            "expect a [batch, time >= 3, 3, height, width] window, got {:?}",
            size
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ValueRange,
        dataset::ChunkIndex,
        model::{CompositeNetworkInit, DeblurFn, MotionFn},
    };

    struct CountingUpdater {
        losses: Vec<f64>,
    }

    impl ParameterUpdate for CountingUpdater {
        fn update(&mut self, loss: &Tensor) -> Fallible<f64> {
            // fails if the loss reaches into an earlier step's freed graph
            loss.backward();
            self.losses.push(loss.double_value(&[]));
            Ok(0.0)
        }

        fn step(&self) -> usize {
            self.losses.len()
        }

        fn learning_rate(&self) -> f64 {
            0.0
        }
    }

    fn init(fix_motion: bool) -> CompositeNetworkInit {
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

    /// A zero field and a deblurring function that returns the center
    /// candidate of the pixel volume, i.e. the previous deblurred frame.
    fn passthrough() -> (MotionFn, DeblurFn) {
        let motion: MotionFn = Box::new(|target, _source, _train| {
            let (batch, _, height, width) = target.size4().unwrap();
            Tensor::zeros(&[batch, 2, height, width], (Kind::Float, target.device()))
        });
        let deblur: DeblurFn = Box::new(|volume, _prev, _curr, _next, _train| volume.narrow(1, 12, 3));
        (motion, deblur)
    }

    fn batch(batch_size: i64, frames: i64, is_first: bool) -> ChunkBatch {
        let opts = (Kind::Float, Device::Cpu);
        ChunkBatch {
            input: Tensor::rand(&[batch_size, frames, 3, 8, 8], opts),
            gt: Tensor::rand(&[batch_size, frames, 3, 8, 8], opts),
            chunks: vec![
                ChunkIndex {
                    video_id: 0,
                    offset: 0
                };
                batch_size as usize
            ],
            is_first: vec![is_first; batch_size as usize],
        }
    }

    #[test]
    fn training_chunk_runs_one_update_per_step() {
        let vs = VarStore::new(Device::Cpu);
        let net = init(false).build(vs.root()).unwrap();
        let mut step_loop = StepLoop::new(&net);
        let mut updater = CountingUpdater { losses: vec![] };

        let report = step_loop.train_chunk(&batch(2, 5, true), &mut updater).unwrap();
        assert_eq!(report.num_steps, 3);
        assert_eq!(updater.losses.len(), 3);
        assert!(report.losses.mean("flow").is_some());

        let mean = updater.losses.iter().sum::<f64>() / 3.0;
        let reported = report.losses.mean("total").unwrap();
        assert!((mean - reported).abs() < 1e-6);

        let state = step_loop.state().get().unwrap();
        assert!(!state.requires_grad());
        let last = report.last_frames.unwrap();
        assert_eq!(last.input.size(), last.result.size());
        assert_eq!(last.gt.size(), vec![2, 3, 8, 8]);
        assert!(last.warped.is_none());
    }

    #[test]
    fn sample_warp_follows_the_loop_setting() {
        let vs = VarStore::new(Device::Cpu);
        let net = init(false).build(vs.root()).unwrap();
        let mut updater = CountingUpdater { losses: vec![] };
        let report = StepLoop::new(&net)
            .save_sample(true)
            .train_chunk(&batch(2, 4, true), &mut updater)
            .unwrap();
        let warped = report.last_frames.unwrap().warped.unwrap();
        assert_eq!(warped.size(), vec![2, 3, 8, 8]);

        let (motion, deblur) = passthrough();
        let net = init(true).build_with(motion, deblur).unwrap();
        let (_, steps) = StepLoop::new(&net)
            .save_sample(true)
            .eval_chunk(&batch(1, 4, true))
            .unwrap();
        assert_eq!(steps.len(), 2);
        for step in &steps {
            assert_eq!(step.sample_warp.as_ref().unwrap().size(), vec![1, 3, 8, 8]);
        }
        let (_, steps) = StepLoop::new(&net).eval_chunk(&batch(1, 3, true)).unwrap();
        assert!(steps[0].sample_warp.is_none());
    }

    #[test]
    fn frozen_motion_trains_on_image_loss_only() {
        let vs = VarStore::new(Device::Cpu);
        let net = init(true).build(vs.root()).unwrap();
        let mut updater = CountingUpdater { losses: vec![] };
        let report = StepLoop::new(&net)
            .train_chunk(&batch(1, 3, true), &mut updater)
            .unwrap();
        assert!(report.losses.mean("flow").is_none());
        assert_eq!(report.losses.mean("image"), report.losses.mean("total"));
    }

    #[test]
    fn state_carries_across_eval_chunks() {
        let (motion, deblur) = passthrough();
        let net = init(true).build_with(motion, deblur).unwrap();
        let mut step_loop = StepLoop::new(&net);

        let first = batch(1, 3, true);
        let (_, steps) = step_loop.eval_chunk(&first).unwrap();
        // the passthrough result of the first step is the first frame
        let expect = first.input.select(1, 0);
        assert!((&steps[0].result - &expect).abs().max().double_value(&[]) < 1e-5);

        let second = batch(1, 3, false);
        let (scores, steps) = step_loop.eval_chunk(&second).unwrap();
        assert!(scores.mean("psnr").is_some());
        // still the first chunk's first frame, carried by the state
        assert!((&steps[0].result - &expect).abs().max().double_value(&[]) < 1e-5);

        let third = batch(1, 3, true);
        let (_, steps) = step_loop.eval_chunk(&third).unwrap();
        let restart = third.input.select(1, 0);
        assert!((&steps[0].result - &restart).abs().max().double_value(&[]) < 1e-5);
    }

    #[test]
    fn continuing_chunk_without_state_is_rejected() {
        let (motion, deblur) = passthrough();
        let net = init(true).build_with(motion, deblur).unwrap();
        assert!(StepLoop::new(&net).eval_chunk(&batch(1, 3, false)).is_err());
    }

    #[test]
    fn eval_rejects_batches() {
        let (motion, deblur) = passthrough();
        let net = init(true).build_with(motion, deblur).unwrap();
        assert!(StepLoop::new(&net).eval_chunk(&batch(2, 3, true)).is_err());
    }

    #[test]
    fn repeated_steps_do_not_grow_the_graph() {
        let vs = VarStore::new(Device::Cpu);
        let net = init(false).build(vs.root()).unwrap();
        let mut step_loop = StepLoop::new(&net);
        let mut updater = CountingUpdater { losses: vec![] };

        for _ in 0..3 {
            step_loop.train_chunk(&batch(1, 6, true), &mut updater).unwrap();
            let state = step_loop.state().get().unwrap();
            assert!(!state.requires_grad());
        }
        assert_eq!(updater.losses.len(), 12);
    }

    #[test]
    fn short_windows_are_dimension_errors() {
        let err = num_steps(&Tensor::zeros(&[1, 2, 3, 8, 8], (Kind::Float, Device::Cpu))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeblurError>(),
            Some(DeblurError::Dimension(_))
        ));
    }
}
