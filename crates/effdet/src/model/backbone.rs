use {
    super::blocks::ConvBlock,
    crate::{
        config::{ActType, ModelConfig},
        error::EffDetError,
    },
    candle_core::Tensor,
    candle_nn::{ModuleT, VarBuilder},
    std::fmt::Debug,
};

/// Feature extractor feeding the fusion stack.
///
/// Both `feature_channels` and `forward_features` are indexed by level:
/// entry 0 is the input image, entry `l` has `1 / 2^l` of its resolution.
pub trait Backbone: Debug + Send + Sync {
    fn feature_channels(&self) -> Vec<usize>;

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>, EffDetError>;
}

/// One stride-2 conv-bn-silu block per level.
#[derive(Debug)]
pub struct StridedBackbone {
    in_channels: usize,
    blocks: Vec<ConvBlock>,
    channels: Vec<usize>,
}

impl StridedBackbone {
    pub fn load(vb: VarBuilder, in_channels: usize, channels: &[usize], eps: f64) -> Result<Self, EffDetError> {
        let mut blocks = Vec::with_capacity(channels.len());
        let mut c_in = in_channels;
        for (i, &c_out) in channels.iter().enumerate() {
            blocks.push(ConvBlock::load(
                vb.pp(format!("stage{}", i + 1)),
                c_in,
                c_out,
                3,
                2,
                1,
                ActType::Swish,
                eps,
            )?);
            c_in = c_out;
        }
        Ok(Self {
            in_channels,
            blocks,
            channels: channels.to_vec(),
        })
    }

    /// RGB backbone with `backbone_channels` from the config.
    pub fn from_config(vb: VarBuilder, config: &ModelConfig) -> Result<Self, EffDetError> {
        Self::load(vb, 3, &config.backbone_channels, config.batch_norm_eps)
    }
}

impl Backbone for StridedBackbone {
    fn feature_channels(&self) -> Vec<usize> {
        std::iter::once(self.in_channels).chain(self.channels.iter().copied()).collect()
    }

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>, EffDetError> {
        let mut feats = Vec::with_capacity(self.blocks.len() + 1);
        feats.push(xs.clone());
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
            feats.push(xs.clone());
        }
        Ok(feats)
    }
}
