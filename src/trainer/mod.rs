mod evaluate;
mod fit;
mod lr_schedule;
mod state;
mod step;
mod update;

pub use evaluate::{Evaluator, VideoScores};
pub use fit::{build_network, Trainer};
pub use lr_schedule::LrSchedule;
pub use state::{LossAccumulator, RecurrentState};
pub use step::{EvalStep, SampleFrames, StepLoop, TrainChunkReport};
pub use update::{clip_grad_norm, ParameterUpdate, Updater, UpdaterInit};
