// temporal window
pub const FRAME_NUM: usize = 3; // prev, curr, next
pub const FRAME_ITR_NUM: usize = 13; // frames per training chunk

// pixel volume
pub const PV_KSIZE: i64 = 5; // 5x5 candidates per pixel

// the motion network downsamples by 32
pub const REFINE_VAL: i64 = 32;

// input decoding
pub const NORM_VAL: f64 = 255.0; // 8-bit frames

// augmentation
pub const NOISE_PROB: f64 = 0.5;
pub const NOISE_STD: f64 = 1e-4;

// crop size
pub const PATCH_HEIGHT: usize = 256;
pub const PATCH_WIDTH: usize = 256;

// optimization
pub const LR_INIT: f64 = 1e-4;
pub const GRAD_CLIP_NORM: f64 = 1.0;
pub const ADAM_BETA1: f64 = 0.9;
pub const WEIGHT_DECAY: f64 = 0.01;
pub const DECAY_RATE: f64 = 0.25;

// baseline architectures
pub const WEIGHT_INIT_GAIN: f64 = 1.0; // xavier uniform gain
pub const FLOW_CHANNELS: i64 = 64;
pub const DEBLUR_CHANNELS: i64 = 64;
pub const DEBLUR_RES_BLOCKS: usize = 4;

// metrics
pub const SSIM_WINDOW: i64 = 11;
pub const SSIM_SIGMA: f64 = 1.5;
pub const PSNR_MIN_MSE: f64 = 1e-10;
