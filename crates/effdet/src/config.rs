use {
    crate::{
        error::EffDetError,
        fpn_config::{FpnName, FusionGraphSpec},
    },
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    std::{path::Path, str::FromStr},
};

/// Activation applied throughout the feature network and heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActType {
    #[serde(alias = "silu", alias = "swish_native")]
    Swish,
    Relu,
    Relu6,
    #[serde(rename = "hswish")]
    HardSwish,
    Mish,
    Gelu,
}

/// How a fusion node combines its resampled inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum WeightMethod {
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "attn")]
    Attn,
    #[serde(rename = "fastattn")]
    FastAttn,
    #[serde(rename = "channel_attn")]
    ChannelAttn,
    #[serde(rename = "channel_fastattn")]
    ChannelFastAttn,
}

impl WeightMethod {
    pub fn has_weights(&self) -> bool {
        !matches!(self, WeightMethod::Sum)
    }

    pub fn is_per_channel(&self) -> bool {
        matches!(self, WeightMethod::ChannelAttn | WeightMethod::ChannelFastAttn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    ObjectDetection,
    Segmentation,
}

fn parse_name<T: DeserializeOwned>(kind: &str, name: &str) -> Result<T, EffDetError> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| EffDetError::Config(format!("unknown {kind} '{name}'")))
}

macro_rules! named_from_str {
    ($ty:ty, $kind:literal) => {
        impl FromStr for $ty {
            type Err = EffDetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_name($kind, s)
            }
        }
    };
}

named_from_str!(ActType, "activation");
named_from_str!(WeightMethod, "weight method");
named_from_str!(PoolingType, "pooling type");
named_from_str!(HeadKind, "head");
named_from_str!(FpnName, "fpn name");

/// Detection decoding and selection parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PostprocessConfig {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub max_detection_points: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.4,
            iou_threshold: 0.5,
            max_detections: 100,
            max_detection_points: 5000,
        }
    }
}

/// Architecture hyperparameters. Immutable once a model is built from it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub backbone_name: String,
    /// Output channels of the backbone at levels 1, 2, ...
    pub backbone_channels: Vec<usize>,
    pub image_size: (usize, usize),
    pub min_level: usize,
    pub max_level: usize,

    pub num_classes: usize,
    pub num_scales: usize,
    pub aspect_ratios: Vec<f64>,
    pub anchor_scale: f64,

    pub fpn_name: FpnName,
    pub fpn_weight_method: WeightMethod,
    /// Explicit topology; wins over `fpn_name` when present.
    pub fpn_config: Option<FusionGraphSpec>,
    pub fpn_num_filters: usize,
    pub fpn_cell_repeats: usize,
    pub box_class_repeats: usize,

    pub act_type: ActType,
    pub separable_conv: bool,
    pub apply_bn_for_resampling: bool,
    pub conv_after_downsample: bool,
    pub conv_bn_act_pattern: bool,
    pub pooling_type: PoolingType,
    pub survival_prob: Option<f64>,
    pub batch_norm_eps: f64,

    pub heads: Vec<HeadKind>,
    pub seg_num_classes: usize,
    pub seg_start_level: usize,
    pub seg_kernel_size: usize,
    pub seg_head_stride: usize,
    /// Adds one more upsampling stage when `min_level > 1`, as in a UNet decoder.
    pub seg_extra_stage: bool,

    pub mean_rgb: [f32; 3],
    pub stddev_rgb: [f32; 3],
    pub postprocess: PostprocessConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "efficientdet-d0".to_string(),
            backbone_name: "efficientnet-b0".to_string(),
            backbone_channels: vec![16, 24, 40, 112, 320],
            image_size: (512, 512),
            min_level: 3,
            max_level: 7,
            num_classes: 90,
            num_scales: 3,
            aspect_ratios: vec![1.0, 2.0, 0.5],
            anchor_scale: 4.0,
            fpn_name: FpnName::BiFpn,
            fpn_weight_method: WeightMethod::FastAttn,
            fpn_config: None,
            fpn_num_filters: 64,
            fpn_cell_repeats: 3,
            box_class_repeats: 3,
            act_type: ActType::Swish,
            separable_conv: true,
            apply_bn_for_resampling: true,
            conv_after_downsample: false,
            conv_bn_act_pattern: false,
            pooling_type: PoolingType::Max,
            survival_prob: None,
            batch_norm_eps: 1e-3,
            heads: vec![HeadKind::ObjectDetection],
            seg_num_classes: 3,
            seg_start_level: 0,
            seg_kernel_size: 3,
            seg_head_stride: 2,
            seg_extra_stage: true,
            mean_rgb: [0.485 * 255.0, 0.456 * 255.0, 0.406 * 255.0],
            stddev_rgb: [0.229 * 255.0, 0.224 * 255.0, 0.225 * 255.0],
            postprocess: PostprocessConfig::default(),
        }
    }
}

/// (name, image size, backbone, backbone channels, fpn filters, cell repeats, head repeats)
const PRESETS: [(&str, usize, &str, [usize; 5], usize, usize, usize); 8] = [
    ("efficientdet-d0", 512, "efficientnet-b0", [16, 24, 40, 112, 320], 64, 3, 3),
    ("efficientdet-d1", 640, "efficientnet-b1", [16, 24, 40, 112, 320], 88, 4, 3),
    ("efficientdet-d2", 768, "efficientnet-b2", [16, 24, 48, 120, 352], 112, 5, 3),
    ("efficientdet-d3", 896, "efficientnet-b3", [24, 32, 48, 136, 384], 160, 6, 4),
    ("efficientdet-d4", 1024, "efficientnet-b4", [24, 32, 56, 160, 448], 224, 7, 4),
    ("efficientdet-d5", 1280, "efficientnet-b5", [24, 40, 64, 176, 512], 288, 7, 4),
    ("efficientdet-d6", 1280, "efficientnet-b6", [32, 40, 72, 200, 576], 384, 8, 5),
    ("efficientdet-d7", 1536, "efficientnet-b6", [32, 40, 72, 200, 576], 384, 8, 5),
];

impl ModelConfig {
    pub fn preset_names() -> impl Iterator<Item = &'static str> {
        PRESETS.iter().map(|p| p.0)
    }

    /// Named EfficientDet configuration (`efficientdet-d0` .. `efficientdet-d7`).
    pub fn preset(name: &str) -> Result<Self, EffDetError> {
        let (_, size, backbone, channels, filters, cells, heads) = PRESETS
            .iter()
            .find(|p| p.0 == name)
            .ok_or_else(|| EffDetError::Config(format!("unknown model preset '{name}'")))?;

        let mut config = Self {
            name: name.to_string(),
            backbone_name: backbone.to_string(),
            backbone_channels: channels.to_vec(),
            image_size: (*size, *size),
            fpn_num_filters: *filters,
            fpn_cell_repeats: *cells,
            box_class_repeats: *heads,
            ..Self::default()
        };
        if *filters >= 384 {
            config.fpn_weight_method = WeightMethod::Sum;
        }
        if name == "efficientdet-d7" {
            config.anchor_scale = 5.0;
        }
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, EffDetError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EffDetError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Returns a copy with the top-level keys of the JSON object replaced.
    pub fn with_overrides(&self, overrides: &str) -> Result<Self, EffDetError> {
        let overrides: serde_json::Value = serde_json::from_str(overrides)?;
        let serde_json::Value::Object(overrides) = overrides else {
            return Err(EffDetError::Config("overrides must be a json object".to_string()));
        };
        let mut merged = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut merged {
            for (key, value) in overrides {
                if !fields.contains_key(&key) {
                    return Err(EffDetError::Config(format!("unknown config field '{key}'")));
                }
                fields.insert(key, value);
            }
        }
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_levels(&self) -> usize {
        self.max_level - self.min_level + 1
    }

    pub fn num_anchors(&self) -> usize {
        self.aspect_ratios.len() * self.num_scales
    }

    pub fn has_head(&self, head: HeadKind) -> bool {
        self.heads.contains(&head)
    }

    /// Fusion topology shared by every cell of the stack.
    pub fn fpn_graph(&self) -> Result<FusionGraphSpec, EffDetError> {
        let graph = match &self.fpn_config {
            Some(graph) => graph.clone(),
            None => self.fpn_name.graph(self.min_level, self.max_level, self.fpn_weight_method)?,
        };
        graph.validate(self.min_level, self.max_level)?;
        Ok(graph)
    }

    pub fn validate(&self) -> Result<(), EffDetError> {
        let fail = |msg: String| Err(EffDetError::Config(msg));

        if self.min_level == 0 {
            return fail("min_level must be at least 1 (level 0 is the input image)".to_string());
        }
        if self.max_level < self.min_level {
            return fail(format!(
                "max_level {} is below min_level {}",
                self.max_level, self.min_level
            ));
        }
        if self.backbone_channels.len() < self.min_level {
            return fail(format!(
                "backbone provides {} levels, min_level is {}",
                self.backbone_channels.len(),
                self.min_level
            ));
        }
        if self.fpn_num_filters == 0 || self.fpn_cell_repeats == 0 {
            return fail("fpn_num_filters and fpn_cell_repeats must be positive".to_string());
        }
        if self.num_scales == 0 || self.aspect_ratios.is_empty() {
            return fail("anchors need at least one scale and one aspect ratio".to_string());
        }
        if self.aspect_ratios.iter().any(|r| *r <= 0.0) {
            return fail(format!("aspect ratios must be positive: {:?}", self.aspect_ratios));
        }
        if self.heads.is_empty() {
            return fail("at least one head must be configured".to_string());
        }
        if let Some(p) = self.survival_prob {
            if !(p > 0.0 && p <= 1.0) {
                return fail(format!("survival_prob must be in (0, 1], got {p}"));
            }
        }
        if self.has_head(HeadKind::Segmentation) {
            if self.seg_head_stride < 2 || self.seg_kernel_size == 0 {
                return fail(format!(
                    "segmentation head needs stride >= 2 and a non-empty kernel, got stride {} kernel {}",
                    self.seg_head_stride, self.seg_kernel_size
                ));
            }
            if self.seg_start_level >= self.num_levels() {
                return fail(format!(
                    "seg_start_level {} must be below the level count {}",
                    self.seg_start_level,
                    self.num_levels()
                ));
            }
        }
        let pp = &self.postprocess;
        if !(0.0..=1.0).contains(&pp.iou_threshold) || !(0.0..=1.0).contains(&pp.score_threshold) {
            return fail("postprocess thresholds must lie in [0, 1]".to_string());
        }
        self.fpn_graph()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for name in ModelConfig::preset_names() {
            let config = ModelConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "preset {name} failed validation");
        }
    }

    #[test]
    fn test_preset_d0_values() {
        let config = ModelConfig::preset("efficientdet-d0").unwrap();
        assert_eq!(config.fpn_num_filters, 64);
        assert_eq!(config.fpn_cell_repeats, 3);
        assert_eq!(config.num_anchors(), 9);
        assert_eq!(config.num_levels(), 5);
        assert_eq!(config.fpn_weight_method, WeightMethod::FastAttn);
    }

    #[test]
    fn test_large_presets_use_sum() {
        let config = ModelConfig::preset("efficientdet-d6").unwrap();
        assert_eq!(config.fpn_weight_method, WeightMethod::Sum);
    }

    #[test]
    fn test_unknown_preset() {
        let err = ModelConfig::preset("efficientdet-d9").unwrap_err();
        assert!(matches!(err, EffDetError::Config(_)));
    }

    #[test]
    fn test_weight_method_from_str() {
        assert_eq!("channel_fastattn".parse::<WeightMethod>().unwrap(), WeightMethod::ChannelFastAttn);
        assert_eq!("sum".parse::<WeightMethod>().unwrap(), WeightMethod::Sum);
        let err = "softattn".parse::<WeightMethod>().unwrap_err();
        assert!(err.to_string().contains("softattn"));
    }

    #[test]
    fn test_activation_aliases() {
        assert_eq!("silu".parse::<ActType>().unwrap(), ActType::Swish);
        assert_eq!("hswish".parse::<ActType>().unwrap(), ActType::HardSwish);
        assert!("tanh".parse::<ActType>().is_err());
    }

    #[test]
    fn test_pooling_type_rejects_unknown() {
        assert!(matches!("min".parse::<PoolingType>(), Err(EffDetError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let config = ModelConfig::default()
            .with_overrides(r#"{"fpn_weight_method": "attn", "min_level": 2, "heads": ["segmentation"]}"#)
            .unwrap();
        assert_eq!(config.fpn_weight_method, WeightMethod::Attn);
        assert_eq!(config.min_level, 2);
        assert_eq!(config.heads, vec![HeadKind::Segmentation]);
    }

    #[test]
    fn test_overrides_reject_unknown_field() {
        let result = ModelConfig::default().with_overrides(r#"{"fpn_width": 3}"#);
        assert!(matches!(result, Err(EffDetError::Config(_))));
    }

    #[test]
    fn test_overrides_reject_unknown_method() {
        let result = ModelConfig::default().with_overrides(r#"{"fpn_weight_method": "softmax"}"#);
        assert!(matches!(result, Err(EffDetError::Config(_))));
    }

    #[test]
    fn test_inverted_levels_rejected() {
        let config = ModelConfig {
            min_level: 5,
            max_level: 4,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_level_qufpn_is_a_config_error() {
        let config = ModelConfig {
            fpn_name: FpnName::QuFpn,
            min_level: 3,
            max_level: 3,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(EffDetError::Config(_))));

        let result = ModelConfig::default().with_overrides(r#"{"fpn_name": "qufpn", "min_level": 4, "max_level": 4}"#);
        assert!(matches!(result, Err(EffDetError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ModelConfig::from_json_str(r#"{"num_classes": 2, "fpn_num_filters": 32}"#).unwrap();
        assert_eq!(config.num_classes, 2);
        assert_eq!(config.fpn_num_filters, 32);
        assert_eq!(config.max_level, 7);
    }
}
