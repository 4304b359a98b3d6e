use super::{
    lr_schedule::LrSchedule,
    state::LossAccumulator,
    step::{SampleFrames, StepLoop},
    update::{ParameterUpdate, Updater, UpdaterInit},
};
use crate::{
    checkpoint::CheckpointManager,
    common::*,
    config::Config,
    dataset::{
        load_split, save_frame, video_partition, ChunkLoaderInit, DistIndexSampler, NoiseAugment,
        SamplingMode, SequenceSampler, SequenceSamplerInit,
    },
    distributed::{ProcessGroup, Role},
    model::{freeze_motion, load_motion_weights, CompositeNetwork, CompositeNetworkInit},
    params,
};

const LOSS_NAMES: &[&str] = &["flow", "image", "total"];

/// Builds the composite network into `vs`, then loads and freezes the
/// motion network as configured.
pub fn build_network(config: &Config, vs: &VarStore) -> Fallible<CompositeNetwork> {
    let model = &config.model;
    let net = CompositeNetworkInit {
        pv_ksize: model.pv_ksize,
        refine_val: model.refine_val,
        fix_motion: model.fix_motion,
        value_range: config.data.value_range,
        flow_channels: params::FLOW_CHANNELS,
        deblur_channels: params::DEBLUR_CHANNELS,
        deblur_res_blocks: params::DEBLUR_RES_BLOCKS,
        weight_gain: model.weight_gain,
    }
    .build(vs.root())?;

    if let Some(path) = &model.motion_weights {
        let loaded = load_motion_weights(vs, path)?;
        info!("loaded {} motion tensors from {}", loaded, path.display());
    }
    if model.fix_motion {
        freeze_motion(vs);
    }
    Ok(net)
}

/// One data-parallel training worker.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trainer {
    config: Config,
    device: Device,
    role: Role,
    #[derivative(Debug = "ignore")]
    group: Arc<dyn ProcessGroup>,
    #[derivative(Debug = "ignore")]
    vs: VarStore,
    net: CompositeNetwork,
    updater: Updater,
    checkpoints: CheckpointManager,
    train_sampler: Arc<SequenceSampler>,
    valid_sampler: Arc<SequenceSampler>,
    #[derivative(Debug = "ignore")]
    pool: Arc<rayon::ThreadPool>,
    start_epoch: usize,
}

impl Trainer {
    pub fn new(config: &Config, device: Device, group: Arc<dyn ProcessGroup>) -> Fallible<Self> {
        let role = group.role();
        let training = &config.training;
        let data = &config.data;

        let train_sampler = SequenceSamplerInit {
            mode: SamplingMode::Train,
            frame_num: config.model.frame_num,
            chunk_len: training.frame_itr_num.get(),
            crop: Some((training.height, training.width)),
            noise: Some(NoiseAugment {
                prob: training.noise_prob,
                std: training.noise_std,
            }),
            norm_val: data.norm_val,
            value_range: data.value_range,
        }
        .build(load_split(&data.train)?)?;
        let valid_sampler = SequenceSamplerInit {
            mode: SamplingMode::Eval,
            frame_num: config.model.frame_num,
            chunk_len: 1,
            crop: None,
            noise: None,
            norm_val: data.norm_val,
            value_range: data.value_range,
        }
        .build(load_split(&data.valid)?)?;

        if role.is_primary() {
            info!(
                "{} training chunks from {} videos, {} validation frames from {} videos",
                train_sampler.len(),
                train_sampler.videos().len(),
                valid_sampler.len(),
                valid_sampler.videos().len()
            );
            fs::create_dir_all(&config.log_dir)?;
        }

        let mut vs = VarStore::new(device);
        let net = build_network(config, &vs)?;

        let checkpoints = CheckpointManager::new(
            config.log_dir.join("checkpoint"),
            &config.mode,
            training.max_ckpt_num,
        );
        let (start_epoch, initial_step) = match &training.resume {
            Some(selector) => {
                let report = checkpoints.load(&mut vs, selector)?;
                match (report.loaded, report.entry) {
                    (true, Some(entry)) => (entry.epoch + 1, entry.step),
                    _ => {
                        warn!("nothing to resume from, training from scratch");
                        (1, 0)
                    }
                }
            }
            None => (1, 0),
        };

        // every rank starts from the primary's parameters
        let mut variables = vs
            .variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(_, var)| var)
            .collect::<Vec<_>>();
        group.broadcast_from_primary(&mut variables)?;

        let updater = UpdaterInit {
            beta1: training.beta1,
            weight_decay: training.weight_decay,
            max_norm: training.gc,
            schedule: LrSchedule::new(
                training.lr_init,
                training.warmup_itr,
                training.lr_schedule.clone(),
            )?,
            initial_step,
        }
        .build(&vs, group.clone())?;

        let num_threads = training
            .loader_workers
            .map(NonZeroUsize::get)
            .unwrap_or_else(num_cpus::get);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("loader-{}", index))
            .build()?;

        Ok(Self {
            config: config.clone(),
            device,
            role,
            group,
            vs,
            net,
            updater,
            checkpoints,
            train_sampler: Arc::new(train_sampler),
            valid_sampler: Arc::new(valid_sampler),
            pool: Arc::new(pool),
            start_epoch,
        })
    }

    pub fn var_store(&self) -> &VarStore {
        &self.vs
    }

    pub fn network(&self) -> &CompositeNetwork {
        &self.net
    }

    /// Trains until `max_epochs` or until any rank observes `stop`.
    pub fn fit(&mut self, stop: &AtomicBool) -> Fallible<()> {
        let training = self.config.training.clone();
        let partition = DistIndexSampler::new(
            self.train_sampler.len(),
            self.group.world_size(),
            self.group.rank(),
            self.config.seed,
            true,
        )?;
        let valid_indices = video_partition(
            self.valid_sampler.index(),
            self.group.world_size(),
            self.group.rank(),
        );

        if self.start_epoch > training.max_epochs {
            info!("already trained for {} epochs", training.max_epochs);
            return Ok(());
        }

        let global_instant = Instant::now();
        for epoch in self.start_epoch..=training.max_epochs {
            let stopped = self.train_epoch(epoch, &partition, stop, global_instant)?;

            let score = if !stopped && epoch % training.valid_every_epoch.max(1) == 0 {
                Some(self.validate(epoch, &valid_indices)?)
            } else {
                None
            };

            let write_ckpt = stopped
                || epoch == training.max_epochs
                || epoch % training.write_ckpt_every_epoch.max(1) == 0;
            if self.role.is_primary() && write_ckpt {
                self.checkpoints
                    .save(&self.vs, epoch, self.updater.step(), score)?;
            }

            if stopped {
                info!("training stopped in epoch {}", epoch);
                break;
            }
        }
        Ok(())
    }

    /// Returns true when the epoch ended early on a stop request.
    fn train_epoch(
        &mut self,
        epoch: usize,
        partition: &DistIndexSampler,
        stop: &AtomicBool,
        global_instant: Instant,
    ) -> Fallible<bool> {
        let training = &self.config.training;
        let loader = ChunkLoaderInit {
            batch_size: training.batch_size.get(),
            prefetch: training.prefetch,
            seed: self.config.seed ^ (epoch as u64).wrapping_mul(0x2545_F491_4F6C_DD1D),
        }
        .spawn(
            self.train_sampler.clone(),
            self.pool.clone(),
            partition.epoch_indices(epoch),
        )?;
        let num_batches = loader.num_batches();

        let mut step_loop = StepLoop::new(&self.net).save_sample(training.save_sample);
        let mut epoch_losses = LossAccumulator::new();
        let mut stopped = false;

        for (itr, batch) in loader.enumerate() {
            // stop requests only take effect between chunks, on all ranks at once
            if self.group.any(stop.load(Ordering::SeqCst))? {
                stopped = true;
                break;
            }

            let step_instant = Instant::now();
            let batch = batch?.to_device(self.device);
            let report = step_loop.train_chunk(&batch, &mut self.updater)?;
            epoch_losses.merge(&report.losses);

            let log_now = (itr + 1) % training.log_every_itr.max(1) == 0;
            if !self.role.is_primary() || !log_now {
                continue;
            }

            let losses = report.losses.means();
            info!(
                "epoch: {}\titr: {}/{}\tstep: {}\tglobal_elapsed: {}s\tchunk_elapsed: {}ms\tlr: {:.3e}\tgrad_norm: {:.4}\tloss: {:.6}\timage_loss: {:.6}\tflow_loss: {:.6}",
                epoch,
                itr + 1,
                num_batches,
                self.updater.step(),
                global_instant.elapsed().as_secs(),
                step_instant.elapsed().as_millis(),
                self.updater.learning_rate(),
                report.grad_norm,
                losses.get("total").copied().unwrap_or(f64::NAN),
                losses.get("image").copied().unwrap_or(f64::NAN),
                losses.get("flow").copied().unwrap_or(0.0),
            );

            if training.save_sample {
                if let Some(frames) = &report.last_frames {
                    let stem = format!("{:05}_{:08}", epoch, self.updater.step());
                    save_sample_frames(&self.config.log_dir.join("sample"), &stem, frames)?;
                }
            }
        }

        let mut values = epoch_losses.to_values(LOSS_NAMES);
        self.group.all_reduce_sum(&mut values)?;
        let epoch_losses = LossAccumulator::from_values(LOSS_NAMES, &values);
        if self.role.is_primary() {
            let summary = epoch_losses
                .means()
                .into_iter()
                .map(|(name, value)| format!("{}_loss: {:.6}", name, value))
                .join("\t");
            info!("epoch: {}\tsummary\t{}", epoch, summary);
        }

        Ok(stopped)
    }

    /// Runs every validation frame through the network and returns the
    /// PSNR averaged over all ranks' frames.
    fn validate(&self, epoch: usize, indices: &[usize]) -> Fallible<f64> {
        let instant = Instant::now();
        let loader = ChunkLoaderInit {
            batch_size: 1,
            prefetch: self.config.training.prefetch,
            seed: self.config.seed,
        }
        .spawn(
            self.valid_sampler.clone(),
            self.pool.clone(),
            indices.to_vec(),
        )?;

        let save_sample = self.config.training.save_sample && self.role.is_primary();
        let mut step_loop = StepLoop::new(&self.net).save_sample(save_sample);
        let mut scores = LossAccumulator::new();
        for (itr, batch) in loader.enumerate() {
            let batch = batch?.to_device(self.device);
            let (chunk_scores, steps) = step_loop.eval_chunk(&batch)?;
            scores.merge(&chunk_scores);

            // the first validation chunk of every epoch is kept
            if save_sample && itr == 0 {
                if let Some(step) = steps.into_iter().last() {
                    let frames = SampleFrames {
                        gt: step.gt.unwrap_or_else(|| step.input.shallow_clone()),
                        input: step.input,
                        result: step.result,
                        warped: step.sample_warp,
                    };
                    let stem = format!("valid_{:05}", epoch);
                    save_sample_frames(&self.config.log_dir.join("sample"), &stem, &frames)?;
                }
            }
        }

        let names = ["psnr"];
        let mut values = scores.to_values(&names);
        self.group.all_reduce_sum(&mut values)?;
        let psnr = LossAccumulator::from_values(&names, &values)
            .mean("psnr")
            .unwrap_or(0.0);

        if self.role.is_primary() {
            info!(
                "epoch: {}\tvalid_psnr: {:.4}\telapsed: {}s",
                epoch,
                psnr,
                instant.elapsed().as_secs()
            );
        } else {
            debug!("rank {} validated {} frames", self.group.rank(), indices.len());
        }
        Ok(psnr)
    }
}

/// Writes `<stem>_{input,output,gt,warped_bb}.png` below `dir`.
fn save_sample_frames(dir: &Path, stem: &str, frames: &SampleFrames) -> Fallible<()> {
    save_frame(&frames.input, dir.join(format!("{}_input.png", stem)))?;
    save_frame(&frames.result, dir.join(format!("{}_output.png", stem)))?;
    save_frame(&frames.gt, dir.join(format!("{}_gt.png", stem)))?;
    if let Some(warped) = &frames.warped {
        save_frame(warped, dir.join(format!("{}_warped_bb.png", stem)))?;
    }
    Ok(())
}
