use {
    crate::{
        config::ModelConfig,
        detector::{Detector, EfficientDetModel},
        error::EffDetError,
        model::{EfficientDetNet, StridedBackbone},
    },
    candle_core::{DType, Device},
    candle_nn::VarBuilder,
    std::path::Path,
};

/// Metadata key holding the preset name in exported weight files.
pub const PRESET_METADATA_KEY: &str = "effdet.preset";

/// Device holder and model factory.
#[derive(Debug)]
pub struct Inference {
    device: Device,
}

impl Inference {
    pub fn cpu() -> Self {
        log::info!("inference device: CPU");
        Self { device: Device::Cpu }
    }

    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize) -> Result<Self, EffDetError> {
        let device = Device::new_cuda(ordinal)?;
        if device.is_cuda() {
            log::info!("inference device: CUDA (ordinal {ordinal})");
        } else {
            log::warn!("inference device: requested CUDA ordinal {ordinal} but device reports non-CUDA");
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builds a model from memory-mapped safetensors weights.
    pub fn load_efficientdet(
        &self,
        weights: impl AsRef<Path>,
        config: &ModelConfig,
    ) -> Result<EfficientDetModel, EffDetError> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], DType::F32, &self.device)? };
        build_model(vb, config)
    }

    /// Detector over a weight file. Without a config the preset is detected
    /// from the file.
    pub fn use_efficientdet(
        &self,
        weights: impl AsRef<Path>,
        config: Option<&ModelConfig>,
    ) -> Result<Detector, EffDetError> {
        let detected;
        let config = match config {
            Some(config) => config,
            None => {
                detected = detect_preset(weights.as_ref())?;
                log::info!("detected preset {}", detected.name);
                &detected
            }
        };
        let model = self.load_efficientdet(weights, config)?;
        Ok(Detector::new(model, self.device.clone()))
    }
}

/// Network with the built-in strided backbone under `backbone.`.
pub fn build_model(vb: VarBuilder, config: &ModelConfig) -> Result<EfficientDetModel, EffDetError> {
    let backbone = StridedBackbone::from_config(vb.pp("backbone"), config)?;
    let net = EfficientDetNet::new(vb, config, Box::new(backbone))?;
    EfficientDetModel::new(net)
}

/// Preset whose fused channel width matches the class net of the weights.
///
/// An explicit `effdet.preset` metadata entry wins over the width lookup.
pub fn detect_preset(path: &Path) -> Result<ModelConfig, EffDetError> {
    use safetensors::SafeTensors;

    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| EffDetError::Io(format!("failed to memory-map safetensors file: {e}")))?;

    let (_, metadata) = SafeTensors::read_metadata(&mmap)
        .map_err(|e| EffDetError::Io(format!("failed to read safetensors header: {e}")))?;
    if let Some(name) = metadata.metadata().as_ref().and_then(|m| m.get(PRESET_METADATA_KEY)) {
        return ModelConfig::preset(name);
    }

    let tensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| EffDetError::Io(format!("failed to deserialize safetensors: {e}")))?;
    let (key, view) = ["class_net.conv_0.pointwise.weight", "class_net.conv_0.weight"]
        .iter()
        .find_map(|key| tensors.tensor(key).ok().map(|view| (*key, view)))
        .ok_or_else(|| EffDetError::Shape("no class net conv found in safetensors".to_string()))?;
    let filters = *view
        .shape()
        .first()
        .ok_or_else(|| EffDetError::Shape(format!("unexpected shape for {key}: {:?}", view.shape())))?;

    let mut matches = ModelConfig::preset_names().filter_map(|name| ModelConfig::preset(name).ok());
    matches
        .find(|config| config.fpn_num_filters == filters)
        .ok_or_else(|| EffDetError::Shape(format!("no preset with {filters} fpn filters")))
}
