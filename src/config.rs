use crate::{checkpoint::CheckpointSelector, common::*, params};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Run name, used as the checkpoint prefix.
    pub mode: String,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub seed: u64,
    #[serde(
        serialize_with = "serialize_devices",
        deserialize_with = "deserialize_devices",
        default = "default_devices"
    )]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub model: ModelConfig,
    pub data: DataConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub eval: EvalConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config: Self = if is_yaml {
            serde_yaml::from_str(&text)?
        } else {
            json5::from_str(&text)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Fallible<()> {
        let reject = |msg: String| -> Fallible<()> { Err(DeblurError::configuration(msg).into()) };

        let ksize = self.model.pv_ksize;
        if ksize <= 0 || ksize % 2 == 0 {
            return reject(format!("PV_ksize must be a positive odd number, got {}", ksize));
        }
        if self.model.frame_num != 3 {
            return reject(format!(
                "frame_num must be 3 (prev, curr, next), got {}",
                self.model.frame_num
            ));
        }
        if self.model.refine_val <= 0 {
            return reject(format!(
                "refine_val must be positive, got {}",
                self.model.refine_val
            ));
        }
        if self.model.weight_gain <= 0.0 {
            return reject(format!(
                "wi must be positive, got {}",
                self.model.weight_gain
            ));
        }
        if self.devices.is_empty() {
            return reject("at least one device is required".into());
        }
        if self.data.norm_val <= 0.0 {
            return reject(format!("norm_val must be positive, got {}", self.data.norm_val));
        }
        if self.training.gc <= 0.0 {
            return reject(format!("gc must be positive, got {}", self.training.gc));
        }
        if !(0.0..=1.0).contains(&self.training.noise_prob) {
            return reject(format!(
                "noise_prob must lie in [0, 1], got {}",
                self.training.noise_prob
            ));
        }
        if self.eval.batch_size.get() != 1 {
            return reject(
                "evaluation batch size must be 1 to carry the recurrent state across chunks".into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_frame_num")]
    pub frame_num: usize,
    #[serde(alias = "PV_ksize", default = "default_pv_ksize")]
    pub pv_ksize: i64,
    #[serde(default = "default_refine_val")]
    pub refine_val: i64,
    /// Freezes the motion network and disables the flow supervision losses.
    #[serde(alias = "fix_BIMNet", default)]
    pub fix_motion: bool,
    /// Pretrained motion weights, loaded into the `motion` namespace.
    #[serde(default)]
    pub motion_weights: Option<PathBuf>,
    /// Xavier uniform gain of the baseline networks.
    #[serde(alias = "wi", default = "default_weight_gain")]
    pub weight_gain: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            frame_num: params::FRAME_NUM,
            pv_ksize: params::PV_KSIZE,
            refine_val: params::REFINE_VAL,
            fix_motion: false,
            motion_weights: None,
            weight_gain: params::WEIGHT_INIT_GAIN,
        }
    }
}

/// The numeric range frames are represented in before any network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRange {
    #[serde(rename = "unit")]
    Unit,
    #[serde(rename = "symmetric")]
    Symmetric,
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::Unit
    }
}

impl ValueRange {
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Self::Unit => (0.0, 1.0),
            Self::Symmetric => (-1.0, 1.0),
        }
    }

    /// Maps a [0, 1] tensor into this range.
    pub fn from_unit(&self, tensor: &Tensor) -> Tensor {
        match self {
            Self::Unit => tensor.shallow_clone(),
            Self::Symmetric => tensor * 2.0 - 1.0,
        }
    }

    /// Maps a tensor in this range back to [0, 1].
    pub fn to_unit(&self, tensor: &Tensor) -> Tensor {
        match self {
            Self::Unit => tensor.shallow_clone(),
            Self::Symmetric => (tensor + 1.0) / 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub value_range: ValueRange,
    #[serde(default = "default_norm_val")]
    pub norm_val: f64,
    pub train: SplitConfig,
    pub valid: SplitConfig,
    #[serde(default)]
    pub eval: Option<SplitConfig>,
}

/// Parallel input / ground-truth folder trees of one split.
///
/// Frames live in `<data_path>/<input_path>/<video>/` and
/// `<data_path>/<gt_path>/<video>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub data_path: PathBuf,
    pub input_path: String,
    pub gt_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: NonZeroUsize,
    #[serde(default = "default_frame_itr_num")]
    pub frame_itr_num: NonZeroUsize,
    #[serde(default = "default_patch_height")]
    pub height: usize,
    #[serde(default = "default_patch_width")]
    pub width: usize,
    #[serde(default = "default_lr_init")]
    pub lr_init: f64,
    #[serde(default = "default_gc")]
    pub gc: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    pub max_epochs: usize,
    #[serde(default)]
    pub lr_schedule: LrScheduleConfig,
    #[serde(default)]
    pub warmup_itr: usize,
    #[serde(default = "default_noise_prob")]
    pub noise_prob: f64,
    #[serde(default = "default_noise_std")]
    pub noise_std: f64,
    /// Loader threads, defaults to the number of CPUs.
    #[serde(default)]
    pub loader_workers: Option<NonZeroUsize>,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default)]
    pub save_sample: bool,
    #[serde(default = "default_one")]
    pub write_ckpt_every_epoch: usize,
    #[serde(default = "default_one")]
    pub valid_every_epoch: usize,
    #[serde(default = "default_log_every_itr")]
    pub log_every_itr: usize,
    #[serde(default = "default_max_ckpt_num")]
    pub max_ckpt_num: usize,
    #[serde(default)]
    pub resume: Option<CheckpointSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LrScheduleConfig {
    /// Multiplies the rate by `decay_rate` at each milestone.
    #[serde(rename = "decay")]
    Decay {
        decay_period: Vec<usize>,
        decay_rate: f64,
    },
    /// Cosine annealing to `eta_min`, restarting after each period.
    #[serde(rename = "cosine_restart")]
    CosineRestart { periods: Vec<usize>, eta_min: f64 },
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self::Decay {
            decay_period: vec![400_000],
            decay_rate: params::DECAY_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default = "default_eval_batch_size")]
    pub batch_size: NonZeroUsize,
    #[serde(default)]
    pub checkpoint: CheckpointSelector,
    #[serde(default = "default_true")]
    pub save_images: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            batch_size: default_eval_batch_size(),
            checkpoint: CheckpointSelector::default(),
            save_images: true,
        }
    }
}

fn default_frame_num() -> usize {
    params::FRAME_NUM
}

fn default_pv_ksize() -> i64 {
    params::PV_KSIZE
}

fn default_refine_val() -> i64 {
    params::REFINE_VAL
}

fn default_weight_gain() -> f64 {
    params::WEIGHT_INIT_GAIN
}

fn default_norm_val() -> f64 {
    params::NORM_VAL
}

fn default_frame_itr_num() -> NonZeroUsize {
    NonZeroUsize::new(params::FRAME_ITR_NUM).unwrap_or(NonZeroUsize::MIN)
}

fn default_patch_height() -> usize {
    params::PATCH_HEIGHT
}

fn default_patch_width() -> usize {
    params::PATCH_WIDTH
}

fn default_lr_init() -> f64 {
    params::LR_INIT
}

fn default_gc() -> f64 {
    params::GRAD_CLIP_NORM
}

fn default_beta1() -> f64 {
    params::ADAM_BETA1
}

fn default_weight_decay() -> f64 {
    params::WEIGHT_DECAY
}

fn default_noise_prob() -> f64 {
    params::NOISE_PROB
}

fn default_noise_std() -> f64 {
    params::NOISE_STD
}

fn default_prefetch() -> usize {
    2
}

fn default_one() -> usize {
    1
}

fn default_log_every_itr() -> usize {
    40
}

fn default_max_ckpt_num() -> usize {
    100
}

fn default_eval_batch_size() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_true() -> bool {
    true
}

fn default_devices() -> Vec<Device> {
    vec![Device::cuda_if_available()]
}

fn serialize_devices<S>(devices: &[Device], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let device_names = devices
        .iter()
        .map(|device| match device {
            Device::Cpu => "cpu".into(),
            Device::Cuda(n) => format!("cuda({})", n),
        })
        .collect::<Vec<String>>();
    device_names.serialize(serializer)
}

fn deserialize_devices<'de, D>(deserializer: D) -> Result<Vec<Device>, D::Error>
where
    D: Deserializer<'de>,
{
    let device_names = Vec::<String>::deserialize(deserializer)?;
    device_names
        .into_iter()
        .map(|name| parse_device(&name).map_err(D::Error::custom))
        .collect()
}

fn parse_device(name: &str) -> Result<Device, String> {
    if name == "cpu" {
        return Ok(Device::Cpu);
    }

    let prefix = "cuda(";
    let suffix = ")";
    if name.starts_with(prefix) && name.ends_with(suffix) {
        let number: usize = name[prefix.len()..(name.len() - suffix.len())]
            .parse()
            .map_err(|_err| format!("invalid device name {}", name))?;
        Ok(Device::Cuda(number))
    } else {
        Err(format!("invalid device name {}", name))
    }
}
