pub mod anchors;
pub mod config;
pub mod detector;
pub mod error;
pub mod fpn_config;
pub mod inference;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod pyramid;

pub use config::{ActType, HeadKind, ModelConfig, PoolingType, PostprocessConfig, WeightMethod};
pub use detector::{Detector, EfficientDetModel, ModelOutputs};
pub use error::EffDetError;
pub use fpn_config::{FpnName, FusionGraphSpec, FusionNodeSpec};
pub use inference::Inference;
pub use model::{Backbone, EfficientDetNet, NetOutputs, StridedBackbone};
pub use postprocess::{Detection, Detections, PostMode};
pub use preprocess::PreMode;
pub use pyramid::Pyramid;
