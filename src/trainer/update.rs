use super::lr_schedule::LrSchedule;
use crate::{common::*, distributed::ProcessGroup};
use tch::nn::Optimizer;

/// Applies one optimization step for a scalar loss.
pub trait ParameterUpdate {
    /// Back-propagates `loss` and updates the parameters. Returns the global
    /// gradient norm before clipping.
    fn update(&mut self, loss: &Tensor) -> Fallible<f64>;

    /// Optimizer steps taken so far.
    fn step(&self) -> usize;

    /// The learning rate of the next step.
    fn learning_rate(&self) -> f64;
}

/// Adam with gradient averaging across the process group, global-norm
/// clipping and a step-indexed learning-rate schedule.
pub struct Updater {
    optimizer: Optimizer,
    params: Vec<Tensor>,
    group: Arc<dyn ProcessGroup>,
    max_norm: f64,
    schedule: LrSchedule,
    step: usize,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("num_params", &self.params.len())
            .field("max_norm", &self.max_norm)
            .field("schedule", &self.schedule)
            .field("step", &self.step)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UpdaterInit {
    pub beta1: f64,
    pub weight_decay: f64,
    pub max_norm: f64,
    pub schedule: LrSchedule,
    /// The step to resume from.
    pub initial_step: usize,
}

impl UpdaterInit {
    /// Builds an optimizer over the variables of `vs` that require gradients.
    pub fn build(self, vs: &VarStore, group: Arc<dyn ProcessGroup>) -> Fallible<Updater> {
        let Self {
            beta1,
            weight_decay,
            max_norm,
            schedule,
            initial_step,
        } = self;

        ensure!(max_norm > 0.0, "gradient clip norm must be positive");

        let optimizer = Adam {
            beta1,
            wd: weight_decay,
            ..Default::default()
        }
        .build(vs, schedule.lr(initial_step))?;

        let params = vs
            .trainable_variables()
            .into_iter()
            .filter(|var| var.requires_grad())
            .collect::<Vec<_>>();
        debug!("optimizing {} tensors", params.len());

        Ok(Updater {
            optimizer,
            params,
            group,
            max_norm,
            schedule,
            step: initial_step,
        })
    }
}

impl ParameterUpdate for Updater {
    fn update(&mut self, loss: &Tensor) -> Fallible<f64> {
        self.optimizer.zero_grad();
        loss.backward();

        let mut grads = self
            .params
            .iter()
            .map(|param| param.grad())
            .filter(|grad| grad.defined())
            .collect::<Vec<_>>();
        self.group.all_reduce_mean(&mut grads)?;
        let norm = clip_grad_norm(&mut grads, self.max_norm);

        self.optimizer.set_lr(self.schedule.lr(self.step));
        self.optimizer.step();
        self.step += 1;
        Ok(norm)
    }

    fn step(&self) -> usize {
        self.step
    }

    fn learning_rate(&self) -> f64 {
        self.schedule.lr(self.step)
    }
}

/// Scales `grads` in place so their joint L2 norm is at most `max_norm`.
/// Returns the norm before scaling.
pub fn clip_grad_norm(grads: &mut [Tensor], max_norm: f64) -> f64 {
    let total = grads
        .iter()
        .map(|grad| {
            let norm = grad.norm().double_value(&[]);
            norm * norm
        })
        .sum::<f64>()
        .sqrt();

    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        tch::no_grad(|| {
            for grad in grads.iter_mut() {
                let scaled = &*grad * scale;
                grad.copy_(&scaled);
            }
        });
    }
    total
}
