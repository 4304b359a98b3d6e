use crate::{common::*, config::LrScheduleConfig};
use std::f64::consts::PI;

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    lr_init: f64,
    warmup_itr: usize,
    kind: LrScheduleConfig,
}

impl LrSchedule {
    pub fn new(lr_init: f64, warmup_itr: usize, kind: LrScheduleConfig) -> Fallible<Self> {
        if lr_init <= 0.0 {
            return Err(DeblurError::configuration(format!(
                "lr_init must be positive, got {}",
                lr_init
            ))
            .into());
        }
        if let LrScheduleConfig::CosineRestart { periods, .. } = &kind {
            if periods.is_empty() || periods.contains(&0) {
                return Err(DeblurError::configuration(
                    "cosine_restart periods must be non-empty and positive",
                )
                .into());
            }
        }

        Ok(Self {
            lr_init,
            warmup_itr,
            kind,
        })
    }

    pub fn lr(&self, step: usize) -> f64 {
        let lr = match &self.kind {
            LrScheduleConfig::Decay {
                decay_period,
                decay_rate,
            } => {
                let passed = decay_period
                    .iter()
                    .filter(|&&milestone| milestone <= step)
                    .count();
                self.lr_init * decay_rate.powi(passed as i32)
            }
            LrScheduleConfig::CosineRestart { periods, eta_min } => {
                let mut start = 0;
                let mut lr = *eta_min;
                for &period in periods {
                    if step < start + period {
                        let progress = (step - start) as f64 / period as f64;
                        lr = eta_min + (self.lr_init - eta_min) * (1.0 + (PI * progress).cos()) / 2.0;
                        break;
                    }
                    start += period;
                }
                lr
            }
        };

        if step < self.warmup_itr {
            lr * (step + 1) as f64 / self.warmup_itr as f64
        } else {
            lr
        }
    }
}
