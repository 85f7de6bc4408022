// EfficientDet network: backbone features, BiFPN fusion and prediction heads.

mod backbone;
mod blocks;
mod cell;
mod fusion;
mod head;
mod net;
mod resample;
mod segment;

pub use backbone::{Backbone, StridedBackbone};
pub use blocks::{ConvBlock, ConvOp, SeparableConv2d, drop_connect};
pub use cell::{FusionCell, FusionStack, LevelArena};
pub use fusion::{FusionNode, OpAfterCombine, combine, normalized_weights};
pub use head::{PredictionNet, class_bias_init};
pub use net::{DetectionOutputs, EfficientDetNet, NetOutputs};
pub use resample::{PoolGeometry, Resampler, pool_to};
pub use segment::{SegmentationHead, same_transpose_config, stage_filters};
