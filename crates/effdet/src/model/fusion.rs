// BiFPN node: resample inputs to one level, combine them, then conv-bn-act.

use {
    super::{
        blocks::{ConvOp, norm_layer},
        cell::LevelArena,
        resample::Resampler,
    },
    crate::{
        config::{ActType, ModelConfig, WeightMethod},
        error::EffDetError,
        fpn_config::FusionNodeSpec,
    },
    candle_core::{Result, Tensor},
    candle_nn::{BatchNorm, Init, Module, VarBuilder, init::DEFAULT_KAIMING_NORMAL, ops::softmax},
};

const FAST_ATTN_EPS: f64 = 1e-4;

/// Per-input weights after normalization, shaped `[inputs, channels]`
/// (`channels` is 1 for scalar methods). `None` for `sum`.
pub fn normalized_weights(weights: &[Tensor], method: WeightMethod) -> Result<Option<Tensor>> {
    match method {
        WeightMethod::Sum => Ok(None),
        WeightMethod::Attn | WeightMethod::ChannelAttn => {
            let stacked = Tensor::stack(weights, 0)?;
            Ok(Some(softmax(&stacked, 0)?))
        }
        WeightMethod::FastAttn | WeightMethod::ChannelFastAttn => {
            let stacked = Tensor::stack(weights, 0)?;
            let total = (stacked.sum_keepdim(0)? + FAST_ATTN_EPS)?;
            Ok(Some(stacked.broadcast_div(&total)?))
        }
    }
}

/// Combines same-shaped NCHW maps with the given edge weights.
pub fn combine(nodes: &[Tensor], weights: &[Tensor], method: WeightMethod) -> Result<Tensor> {
    let stacked = Tensor::stack(nodes, 0)?;
    match normalized_weights(weights, method)? {
        None => stacked.sum(0),
        Some(w) => {
            let (n, c) = w.dims2()?;
            let w = w.reshape((n, 1, c, 1, 1))?.to_dtype(stacked.dtype())?;
            stacked.broadcast_mul(&w)?.sum(0)
        }
    }
}

/// Activation, 3x3 conv and batch norm applied to a freshly combined map.
#[derive(Debug)]
pub struct OpAfterCombine {
    conv: ConvOp,
    bn: BatchNorm,
    act: ActType,
    conv_bn_act_pattern: bool,
}

impl OpAfterCombine {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let filters = config.fpn_num_filters;
        let bias = (!config.conv_bn_act_pattern).then_some(0.0);
        let conv = ConvOp::load(
            vb.pp("conv"),
            config.separable_conv,
            filters,
            filters,
            3,
            DEFAULT_KAIMING_NORMAL,
            bias,
        )?;
        let bn = norm_layer(filters, config.batch_norm_eps, vb.pp("bn"))?;
        Ok(Self {
            conv,
            bn,
            act: config.act_type,
            conv_bn_act_pattern: config.conv_bn_act_pattern,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        if !self.conv_bn_act_pattern {
            xs = self.act.apply(&xs)?;
        }
        xs = self.conv.forward(&xs)?.apply_t(&self.bn, train)?;
        if self.conv_bn_act_pattern {
            xs = self.act.apply(&xs)?;
        }
        Ok(xs)
    }
}

/// One node of a fusion cell. Produces a single map at `level`.
#[derive(Debug)]
pub struct FusionNode {
    level: usize,
    inputs_offsets: Vec<usize>,
    method: WeightMethod,
    pub(crate) resamplers: Vec<Resampler>,
    edge_weights: Vec<Tensor>,
    pub(crate) op_after_combine: OpAfterCombine,
}

impl FusionNode {
    /// `arena_channels[i]` is the channel count of arena entry `i`.
    pub fn load(
        vb: VarBuilder,
        spec: &FusionNodeSpec,
        method: WeightMethod,
        arena_channels: &[usize],
        config: &ModelConfig,
    ) -> std::result::Result<Self, EffDetError> {
        let filters = config.fpn_num_filters;
        let mut resamplers = Vec::with_capacity(spec.inputs_offsets.len());
        let mut edge_weights = Vec::new();

        for (i, &offset) in spec.inputs_offsets.iter().enumerate() {
            let in_channels = *arena_channels.get(offset).ok_or_else(|| {
                EffDetError::Config(format!(
                    "node at level {} reads offset {offset}, arena has {} entries",
                    spec.level,
                    arena_channels.len()
                ))
            })?;
            let name = format!("resample_{i}_{offset}_{}", arena_channels.len());
            resamplers.push(Resampler::load(vb.pp(name), in_channels, filters, config)?);

            if method.has_weights() {
                let width = if method.is_per_channel() { filters } else { 1 };
                let name = if i == 0 { "WSM".to_string() } else { format!("WSM_{i}") };
                edge_weights.push(vb.get_with_hints(width, &name, Init::Const(1.0))?);
            }
        }

        let op_after_combine = OpAfterCombine::load(vb.pp(format!("op_after_combine{}", arena_channels.len())), config)?;

        Ok(Self {
            level: spec.level,
            inputs_offsets: spec.inputs_offsets.clone(),
            method,
            resamplers,
            edge_weights,
            op_after_combine,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn edge_weights(&self) -> &[Tensor] {
        &self.edge_weights
    }

    /// Fuses the referenced arena entries into one map at this node's level.
    pub fn forward(&self, arena: &LevelArena, train: bool) -> std::result::Result<Tensor, EffDetError> {
        let target = arena.target_hw(self.level)?;
        let mut nodes = Vec::with_capacity(self.inputs_offsets.len());
        for (resampler, &offset) in self.resamplers.iter().zip(&self.inputs_offsets) {
            nodes.push(resampler.forward(arena.get(offset)?, Some(target), train)?);
        }
        let fused = combine(&nodes, &self.edge_weights, self.method)?;
        Ok(self.op_after_combine.forward(&fused, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn scalars(values: &[f32]) -> Vec<Tensor> {
        values
            .iter()
            .map(|v| Tensor::new(&[*v], &Device::Cpu).unwrap())
            .collect()
    }

    fn filled(value: f32) -> Tensor {
        (Tensor::ones((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap() * value as f64).unwrap()
    }

    #[test]
    fn test_softmax_weights_sum_to_one() {
        for values in [[0.0f32, 0.0, 0.0], [1.0, -3.0, 7.5], [100.0, 100.0, -50.0]] {
            for method in [WeightMethod::Attn, WeightMethod::ChannelAttn] {
                let w = normalized_weights(&scalars(&values), method).unwrap().unwrap();
                let total: f32 = w.sum_all().unwrap().to_scalar().unwrap();
                assert!((total - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_zero_init_softmax_is_uniform() {
        let w = normalized_weights(&scalars(&[0.0, 0.0]), WeightMethod::Attn).unwrap().unwrap();
        let values: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_channel_softmax_normalizes_each_channel() {
        let device = Device::Cpu;
        let a = Tensor::new(&[0f32, 2.0, -1.0], &device).unwrap();
        let b = Tensor::new(&[3f32, 2.0, 4.0], &device).unwrap();
        let w = normalized_weights(&[a, b], WeightMethod::ChannelAttn).unwrap().unwrap();
        let per_channel: Vec<f32> = w.sum(0).unwrap().to_vec1().unwrap();
        assert!(per_channel.iter().all(|v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_fastattn_scale_invariant() {
        let nodes = vec![filled(1.0), filled(3.0)];
        for method in [WeightMethod::FastAttn, WeightMethod::ChannelFastAttn] {
            let a = combine(&nodes, &scalars(&[2.0, 6.0]), method).unwrap();
            let b = combine(&nodes, &scalars(&[20.0, 60.0]), method).unwrap();
            let diff: f32 = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
            assert!(diff < 1e-3);
        }
    }

    #[test]
    fn test_fastattn_values() {
        let nodes = vec![filled(1.0), filled(3.0)];
        let out = combine(&nodes, &scalars(&[1.0, 1.0]), WeightMethod::FastAttn).unwrap();
        let v: f32 = out.flatten_all().unwrap().get(0).unwrap().to_scalar().unwrap();
        // (1 + 3) / (2 + 1e-4)
        assert!((v - 4.0 / 2.0001).abs() < 1e-5);
    }

    #[test]
    fn test_sum_combination() {
        let nodes = vec![filled(1.0), filled(3.0), filled(-0.5)];
        let out = combine(&nodes, &[], WeightMethod::Sum).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3, 3]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (*v - 3.5).abs() < 1e-6));
    }

    #[test]
    fn test_per_channel_weights_broadcast() {
        let device = Device::Cpu;
        let nodes = vec![filled(1.0), filled(3.0)];
        let w0 = Tensor::new(&[1f32, 0.0], &device).unwrap();
        let w1 = Tensor::new(&[0f32, 1.0], &device).unwrap();
        let out = combine(&nodes, &[w0, w1], WeightMethod::ChannelFastAttn).unwrap();
        let channel0: f32 = out.get(0).unwrap().get(0).unwrap().mean_all().unwrap().to_scalar().unwrap();
        let channel1: f32 = out.get(0).unwrap().get(1).unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!((channel0 - 1.0).abs() < 1e-3);
        assert!((channel1 - 3.0).abs() < 1e-3);
    }

    fn op_after_combine(conv_bn_act_pattern: bool) -> (OpAfterCombine, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ModelConfig {
            fpn_num_filters: 2,
            separable_conv: false,
            act_type: ActType::Relu,
            conv_bn_act_pattern,
            ..ModelConfig::default()
        };
        let op = OpAfterCombine::load(vb.pp("op"), &config).unwrap();
        (op, varmap)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_conv_bn_act_pattern_order() {
        let xs = Tensor::randn(0f32, 1f32, (1, 2, 5, 5), &Device::Cpu).unwrap();
        let negatives: f32 = xs.lt(0f32).unwrap().to_dtype(DType::F32).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(negatives > 0.0);

        // conv, bn, then act: nothing negative survives the final relu
        let (op, _varmap) = op_after_combine(true);
        let out = op.forward(&xs, false).unwrap();
        let min: f32 = out.min_all().unwrap().to_scalar().unwrap();
        assert!(min >= 0.0);
        let expected = op.conv.forward(&xs).unwrap().apply_t(&op.bn, false).unwrap().relu().unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);

        // act first, then conv and bn
        let (op, _varmap) = op_after_combine(false);
        let out = op.forward(&xs, false).unwrap();
        let expected = op.conv.forward(&xs.relu().unwrap()).unwrap().apply_t(&op.bn, false).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
        let unordered = op.conv.forward(&xs).unwrap().apply_t(&op.bn, false).unwrap().relu().unwrap();
        assert!(max_abs_diff(&out, &unordered) > 1e-4);
    }

    #[test]
    fn test_conv_bias_only_without_bn_act_pattern() {
        let (_op, varmap) = op_after_combine(true);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"op.conv.weight".to_string()));
        assert!(!names.contains(&"op.conv.bias".to_string()));

        let (_op, varmap) = op_after_combine(false);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"op.conv.bias".to_string()));
    }
}
