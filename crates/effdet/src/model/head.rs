// Per-level class and box prediction networks.

use {
    super::blocks::{ConvOp, drop_connect, norm_layer},
    crate::{
        config::{ActType, ModelConfig},
        error::EffDetError,
        pyramid::Pyramid,
    },
    candle_core::Tensor,
    candle_nn::{BatchNorm, Init, Module, VarBuilder},
};

const CLASS_PRIOR: f64 = 0.01;

/// Bias that makes every anchor start out at `CLASS_PRIOR` foreground probability.
pub fn class_bias_init() -> f64 {
    -((1.0 - CLASS_PRIOR) / CLASS_PRIOR).ln()
}

const REGULAR_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.01,
};

/// `repeats` rounds of conv-bn-act followed by a prediction conv.
///
/// The conv of each round is shared by all levels while every (round, level)
/// pair owns its batch norm, so statistics stay per resolution.
#[derive(Debug)]
pub struct PredictionNet {
    convs: Vec<ConvOp>,
    bns: Vec<Vec<BatchNorm>>,
    predict: ConvOp,
    act: ActType,
    survival_prob: Option<f64>,
    min_level: usize,
    out_channels: usize,
}

impl PredictionNet {
    fn load(
        vb: VarBuilder,
        config: &ModelConfig,
        out_channels: usize,
        predict_bias: f64,
    ) -> Result<Self, EffDetError> {
        let filters = config.fpn_num_filters;
        let mut convs = Vec::with_capacity(config.box_class_repeats);
        let mut bns = Vec::with_capacity(config.box_class_repeats);
        for i in 0..config.box_class_repeats {
            convs.push(ConvOp::load(
                vb.pp(format!("conv_{i}")),
                config.separable_conv,
                filters,
                filters,
                3,
                REGULAR_INIT,
                Some(0.0),
            )?);
            let per_level = (config.min_level..=config.max_level)
                .map(|level| norm_layer(filters, config.batch_norm_eps, vb.pp(format!("bn_{i}_{level}"))))
                .collect::<candle_core::Result<Vec<_>>>()?;
            bns.push(per_level);
        }
        let predict = ConvOp::load(
            vb.pp("predict"),
            config.separable_conv,
            filters,
            out_channels,
            3,
            REGULAR_INIT,
            Some(predict_bias),
        )?;
        Ok(Self {
            convs,
            bns,
            predict,
            act: config.act_type,
            survival_prob: config.survival_prob,
            min_level: config.min_level,
            out_channels,
        })
    }

    /// Classification net: `num_classes * num_anchors` logits per location.
    pub fn class_net(vb: VarBuilder, config: &ModelConfig) -> Result<Self, EffDetError> {
        Self::load(vb, config, config.num_classes * config.num_anchors(), class_bias_init())
    }

    /// Box regression net: `4 * num_anchors` box deltas per location.
    pub fn box_net(vb: VarBuilder, config: &ModelConfig) -> Result<Self, EffDetError> {
        Self::load(vb, config, 4 * config.num_anchors(), 0.0)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn forward_level(&self, xs: &Tensor, level_id: usize, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            let residual = xs.clone();
            xs = conv.forward(&xs)?.apply_t(&self.bns[i][level_id], train)?;
            xs = self.act.apply(&xs)?;
            if let (true, Some(p)) = (i > 0, self.survival_prob) {
                xs = (drop_connect(&xs, train, p)? + residual)?;
            }
        }
        self.predict.forward(&xs)
    }

    /// One `[b, out_channels, h, w]` tensor per pyramid level.
    pub fn forward(&self, feats: &Pyramid, train: bool) -> Result<Vec<Tensor>, EffDetError> {
        let num_levels = self.bns.first().map_or(feats.len(), Vec::len);
        if feats.min_level() != self.min_level || feats.len() != num_levels {
            return Err(EffDetError::Shape(format!(
                "prediction net expects {num_levels} levels from {}, got {} from {}",
                self.min_level,
                feats.len(),
                feats.min_level()
            )));
        }
        feats
            .maps()
            .iter()
            .enumerate()
            .map(|(level_id, xs)| Ok(self.forward_level(xs, level_id, train)?))
            .collect()
    }
}
