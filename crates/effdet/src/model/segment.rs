// Decoder that upsamples the fused pyramid into per-pixel class logits.

use {
    super::blocks::norm_layer,
    crate::{
        config::{ActType, ModelConfig},
        error::EffDetError,
        pyramid::Pyramid,
    },
    candle_core::Tensor,
    candle_nn::{
        BatchNorm, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder, conv_transpose2d,
        conv_transpose2d_no_bias,
    },
};

/// Transposed-conv settings whose output is exactly `stride` times the input.
pub fn same_transpose_config(kernel: usize, stride: usize) -> ConvTranspose2dConfig {
    let padding = (kernel.saturating_sub(stride)).div_ceil(2);
    ConvTranspose2dConfig {
        padding,
        output_padding: stride + 2 * padding - kernel,
        stride,
        dilation: 1,
    }
}

/// Output width of every decoder stage.
pub fn stage_filters(config: &ModelConfig) -> Vec<usize> {
    let top = if config.seg_extra_stage && config.min_level > 1 {
        config.max_level + 1
    } else {
        config.max_level
    };
    let stages = top.saturating_sub(config.min_level + config.seg_start_level);
    let mut filters = vec![config.fpn_num_filters; stages];
    match (config.min_level, stages) {
        (2, n) if n >= 1 => filters[n - 1] /= 2,
        (1, n) if n >= 2 => {
            filters[n - 2] /= 2;
            filters[n - 1] /= 4;
        }
        _ => {}
    }
    filters
}

#[derive(Debug)]
struct Stage {
    upsample: ConvTranspose2d,
    bn: BatchNorm,
}

#[derive(Debug)]
pub struct SegmentationHead {
    stages: Vec<Stage>,
    head: ConvTranspose2d,
    act: ActType,
    start: usize,
    num_levels: usize,
}

impl SegmentationHead {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self, EffDetError> {
        let num_levels = config.num_levels();
        let start = config.seg_start_level;
        if start >= num_levels {
            return Err(EffDetError::Config(format!(
                "seg_start_level {start} must be below the level count {num_levels}"
            )));
        }
        let kernel = config.seg_kernel_size;
        let skips = num_levels - 1 - start;

        let mut stages = Vec::new();
        let mut in_channels = config.fpn_num_filters;
        for (i, filters) in stage_filters(config).into_iter().enumerate() {
            let upsample = conv_transpose2d_no_bias(
                in_channels,
                filters,
                kernel,
                same_transpose_config(kernel, 2),
                vb.pp(format!("upsample_{i}")),
            )?;
            let bn = norm_layer(filters, config.batch_norm_eps, vb.pp(format!("bn_{i}")))?;
            log::debug!("seg stage {i}: {in_channels} -> {filters}, skip {}", i < skips);
            in_channels = if i < skips { filters + config.fpn_num_filters } else { filters };
            stages.push(Stage { upsample, bn });
        }

        let head = conv_transpose2d(
            in_channels,
            config.seg_num_classes,
            kernel,
            same_transpose_config(kernel, config.seg_head_stride),
            vb.pp("head"),
        )?;

        Ok(Self {
            stages,
            head,
            act: config.act_type,
            start,
            num_levels,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Logits `[b, seg_num_classes, h, w]`. Resizing to the input image is
    /// left to the caller.
    pub fn forward(&self, feats: &Pyramid, train: bool) -> Result<Tensor, EffDetError> {
        if feats.len() != self.num_levels {
            return Err(EffDetError::Shape(format!(
                "segmentation head expects {} levels, got {}",
                self.num_levels,
                feats.len()
            )));
        }
        let mut coarse_first = feats.maps().iter().rev().skip(self.start);
        let Some(first) = coarse_first.next() else {
            return Err(EffDetError::Shape("segmentation head got no start level".to_string()));
        };
        let mut skips = coarse_first;

        let mut xs = first.clone();
        for stage in &self.stages {
            xs = xs.apply(&stage.upsample)?.apply_t(&stage.bn, train)?;
            xs = self.act.apply(&xs)?;
            if let Some(skip) = skips.next() {
                xs = Tensor::cat(&[&xs, skip], 1)?;
            }
        }
        Ok(xs.apply(&self.head)?)
    }
}
