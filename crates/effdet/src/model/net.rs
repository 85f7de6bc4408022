use {
    super::{
        backbone::Backbone, cell::FusionStack, head::PredictionNet, resample::Resampler,
        segment::SegmentationHead,
    },
    crate::{
        config::{HeadKind, ModelConfig},
        error::EffDetError,
        pyramid::Pyramid,
    },
    candle_core::Tensor,
    candle_nn::VarBuilder,
};

/// Raw per-level head outputs, finest level first.
#[derive(Debug, Clone)]
pub struct DetectionOutputs {
    /// `[b, num_classes * num_anchors, h, w]` per level.
    pub class_outputs: Vec<Tensor>,
    /// `[b, 4 * num_anchors, h, w]` per level.
    pub box_outputs: Vec<Tensor>,
}

#[derive(Debug, Clone)]
pub struct NetOutputs {
    pub detection: Option<DetectionOutputs>,
    pub segmentation: Option<Tensor>,
}

/// Backbone, extra coarse levels, fusion stack and the configured heads.
#[derive(Debug)]
pub struct EfficientDetNet {
    config: ModelConfig,
    backbone: Box<dyn Backbone>,
    first_extra_level: usize,
    extra_resamplers: Vec<Resampler>,
    fpn_cells: FusionStack,
    class_net: Option<PredictionNet>,
    box_net: Option<PredictionNet>,
    seg_head: Option<SegmentationHead>,
}

impl EfficientDetNet {
    pub fn new(vb: VarBuilder, config: &ModelConfig, backbone: Box<dyn Backbone>) -> Result<Self, EffDetError> {
        config.validate()?;
        log::info!(
            "building {}: levels {}..={}, {} filters, {} cells, heads {:?}",
            config.name,
            config.min_level,
            config.max_level,
            config.fpn_num_filters,
            config.fpn_cell_repeats,
            config.heads
        );

        let channels = backbone.feature_channels();
        let backbone_top = channels.len().saturating_sub(1);
        if config.min_level > backbone_top {
            return Err(EffDetError::Config(format!(
                "backbone stops at level {backbone_top}, min_level is {}",
                config.min_level
            )));
        }
        let fused_top = backbone_top.min(config.max_level);
        let mut input_channels = channels[config.min_level..=fused_top].to_vec();

        let mut extra_resamplers = Vec::new();
        for level in fused_top + 1..=config.max_level {
            let in_channels = *input_channels.last().unwrap_or(&config.fpn_num_filters);
            log::debug!("extra level {level}: {in_channels} -> {}", config.fpn_num_filters);
            extra_resamplers.push(Resampler::load(
                vb.pp(format!("resample_p{level}")),
                in_channels,
                config.fpn_num_filters,
                config,
            )?);
            input_channels.push(config.fpn_num_filters);
        }

        let fpn_cells = FusionStack::load(vb.pp("fpn_cells"), config, &input_channels)?;

        let (class_net, box_net) = if config.has_head(HeadKind::ObjectDetection) {
            (
                Some(PredictionNet::class_net(vb.pp("class_net"), config)?),
                Some(PredictionNet::box_net(vb.pp("box_net"), config)?),
            )
        } else {
            (None, None)
        };
        let seg_head = if config.has_head(HeadKind::Segmentation) {
            Some(SegmentationHead::load(vb.pp("seg_head"), config)?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            backbone,
            first_extra_level: fused_top + 1,
            extra_resamplers,
            fpn_cells,
            class_net,
            box_net,
            seg_head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn fpn_cells(&self) -> &FusionStack {
        &self.fpn_cells
    }

    /// Runs the whole network on a `[b, 3, h, w]` image batch.
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<NetOutputs, EffDetError> {
        let feats = self.backbone.forward_features(images, train)?;
        self.forward_pyramid(Pyramid::new(0, feats)?, train)
    }

    /// Builds the fused pyramid `[min_level, max_level]` from backbone features.
    pub fn features(&self, backbone_feats: Pyramid, train: bool) -> Result<Pyramid, EffDetError> {
        let mut feats = backbone_feats.slice(self.config.min_level, self.config.max_level)?;
        if feats.max_level() + 1 != self.first_extra_level {
            return Err(EffDetError::Shape(format!(
                "expected backbone levels up to {}, got up to {}",
                self.first_extra_level - 1,
                backbone_feats.max_level()
            )));
        }
        for resampler in &self.extra_resamplers {
            let coarsest = feats.maps()[feats.len() - 1].clone();
            feats.push(resampler.forward(&coarsest, None, train)?);
        }
        self.fpn_cells.forward(feats, train)
    }

    /// Runs everything after the backbone on a pyramid of backbone features.
    pub fn forward_pyramid(&self, backbone_feats: Pyramid, train: bool) -> Result<NetOutputs, EffDetError> {
        let fpn_feats = self.features(backbone_feats, train)?;

        let detection = match (&self.class_net, &self.box_net) {
            (Some(class_net), Some(box_net)) => Some(DetectionOutputs {
                class_outputs: class_net.forward(&fpn_feats, train)?,
                box_outputs: box_net.forward(&fpn_feats, train)?,
            }),
            _ => None,
        };
        let segmentation = self
            .seg_head
            .as_ref()
            .map(|head| head.forward(&fpn_feats, train))
            .transpose()?;

        Ok(NetOutputs {
            detection,
            segmentation,
        })
    }
}
