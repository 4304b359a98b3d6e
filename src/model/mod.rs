pub mod align;
pub mod arch;
mod composite;
pub mod network;
mod pixel_volume;
mod warp;

pub use composite::{
    CompositeInput, CompositeNetwork, CompositeNetworkInit, CompositeOutput, FlowSupervision,
    FlowVariant, WarpedImage,
};
pub use network::{freeze_motion, load_motion_weights, DeblurFn, MotionFn, SubNetwork};
pub use pixel_volume::PixelVolume;
pub use warp::{warp, warp_with, WarpPadding};
