// Fusion cells and the repeated stack of them.

use {
    super::fusion::FusionNode,
    crate::{config::ModelConfig, error::EffDetError, fpn_config::FusionGraphSpec, pyramid::Pyramid},
    candle_core::Tensor,
    candle_nn::VarBuilder,
};

/// Append-only storage for one cell pass.
///
/// Entries `0..num_levels` are the cell inputs, every fusion node appends one
/// more. Each level remembers its most recent entry; that entry is what the
/// cell outputs for the level.
#[derive(Debug)]
pub struct LevelArena {
    min_level: usize,
    num_levels: usize,
    capacity: usize,
    entries: Vec<Tensor>,
    latest: Vec<usize>,
}

impl LevelArena {
    pub fn new(inputs: &Pyramid, capacity: usize) -> Self {
        let num_levels = inputs.len();
        let mut entries = Vec::with_capacity(capacity.max(num_levels));
        entries.extend(inputs.maps().iter().cloned());
        Self {
            min_level: inputs.min_level(),
            num_levels,
            capacity: capacity.max(num_levels),
            entries,
            latest: (0..num_levels).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, offset: usize) -> Result<&Tensor, EffDetError> {
        self.entries.get(offset).ok_or_else(|| {
            EffDetError::Config(format!(
                "arena offset {offset} not produced yet ({} entries)",
                self.entries.len()
            ))
        })
    }

    fn level_index(&self, level: usize) -> Result<usize, EffDetError> {
        level
            .checked_sub(self.min_level)
            .filter(|i| *i < self.num_levels)
            .ok_or_else(|| {
                EffDetError::Config(format!(
                    "level {level} outside arena levels [{}, {}]",
                    self.min_level,
                    self.min_level + self.num_levels - 1
                ))
            })
    }

    /// Spatial size of the cell input at `level`; every map fused into that
    /// level is resampled to it.
    pub fn target_hw(&self, level: usize) -> Result<(usize, usize), EffDetError> {
        let (_b, _c, h, w) = self.entries[self.level_index(level)?].dims4()?;
        Ok((h, w))
    }

    pub fn push(&mut self, level: usize, map: Tensor) -> Result<(), EffDetError> {
        let index = self.level_index(level)?;
        if self.entries.len() == self.capacity {
            return Err(EffDetError::Config(format!("arena is full ({} entries)", self.capacity)));
        }
        self.latest[index] = self.entries.len();
        self.entries.push(map);
        Ok(())
    }

    pub fn latest(&self, level: usize) -> Option<&Tensor> {
        let index = self.level_index(level).ok()?;
        self.entries.get(self.latest[index])
    }

    pub fn into_pyramid(self) -> Result<Pyramid, EffDetError> {
        let maps = self.latest.iter().map(|&i| self.entries[i].clone()).collect();
        Pyramid::new(self.min_level, maps)
    }
}

/// One pass of cross-scale fusion over the whole pyramid.
#[derive(Debug)]
pub struct FusionCell {
    nodes: Vec<FusionNode>,
    min_level: usize,
    num_levels: usize,
    arena_len: usize,
}

impl FusionCell {
    /// `input_channels[i]` is the width of the input at level `min_level + i`.
    pub fn load(
        vb: VarBuilder,
        graph: &FusionGraphSpec,
        input_channels: &[usize],
        config: &ModelConfig,
    ) -> Result<Self, EffDetError> {
        let num_levels = config.num_levels();
        if input_channels.len() != num_levels {
            return Err(EffDetError::Config(format!(
                "fusion cell expects {num_levels} input levels, got {}",
                input_channels.len()
            )));
        }
        graph.validate(config.min_level, config.max_level)?;

        let mut arena_channels = input_channels.to_vec();
        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for (i, spec) in graph.nodes.iter().enumerate() {
            log::debug!("fnode {i}: level {} inputs {:?}", spec.level, spec.inputs_offsets);
            let method = graph.node_weight_method(spec);
            nodes.push(FusionNode::load(vb.pp(format!("fnode{i}")), spec, method, &arena_channels, config)?);
            arena_channels.push(config.fpn_num_filters);
        }

        Ok(Self {
            nodes,
            min_level: config.min_level,
            num_levels,
            arena_len: graph.arena_len(num_levels),
        })
    }

    pub fn nodes(&self) -> &[FusionNode] {
        &self.nodes
    }

    pub fn forward(&self, inputs: &Pyramid, train: bool) -> Result<Pyramid, EffDetError> {
        if inputs.min_level() != self.min_level || inputs.len() != self.num_levels {
            return Err(EffDetError::Shape(format!(
                "fusion cell expects levels [{}, {}], got [{}, {}]",
                self.min_level,
                self.min_level + self.num_levels - 1,
                inputs.min_level(),
                inputs.max_level()
            )));
        }
        let mut arena = LevelArena::new(inputs, self.arena_len);
        for node in &self.nodes {
            let map = node.forward(&arena, train)?;
            arena.push(node.level(), map)?;
        }
        arena.into_pyramid()
    }
}

/// `fpn_cell_repeats` cells run back to back.
#[derive(Debug)]
pub struct FusionStack {
    cells: Vec<FusionCell>,
}

impl FusionStack {
    pub fn load(vb: VarBuilder, config: &ModelConfig, input_channels: &[usize]) -> Result<Self, EffDetError> {
        let graph = config.fpn_graph()?;
        let fused = vec![config.fpn_num_filters; config.num_levels()];
        let mut cells = Vec::with_capacity(config.fpn_cell_repeats);
        for rep in 0..config.fpn_cell_repeats {
            let channels = if rep == 0 { input_channels } else { &fused[..] };
            cells.push(FusionCell::load(vb.pp(format!("cell_{rep}")), &graph, channels, config)?);
        }
        Ok(Self { cells })
    }

    pub fn cells(&self) -> &[FusionCell] {
        &self.cells
    }

    pub fn forward(&self, inputs: Pyramid, train: bool) -> Result<Pyramid, EffDetError> {
        self.cells.iter().try_fold(inputs, |feats, cell| cell.forward(&feats, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PoolingType, WeightMethod},
        fpn_config::FusionNodeSpec,
        model::resample::pool_to,
    };
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_pyramid(channels: &[usize], top: usize) -> Pyramid {
        let maps = channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let s = top >> i;
                Tensor::randn(0f32, 1f32, (1, c, s, s), &Device::Cpu).unwrap()
            })
            .collect();
        Pyramid::new(3, maps).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    fn sum_graph(nodes: Vec<(usize, Vec<usize>)>) -> FusionGraphSpec {
        FusionGraphSpec {
            weight_method: WeightMethod::Sum,
            nodes: nodes
                .into_iter()
                .map(|(level, inputs_offsets)| FusionNodeSpec {
                    level,
                    inputs_offsets,
                    weight_method: None,
                })
                .collect(),
        }
    }

    fn small_config(graph: FusionGraphSpec) -> ModelConfig {
        ModelConfig {
            fpn_num_filters: 64,
            fpn_cell_repeats: 1,
            fpn_config: Some(graph),
            separable_conv: false,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_arena_last_writer_wins() {
        let device = Device::Cpu;
        let inputs = random_pyramid(&[4, 4, 4], 8);
        let mut arena = LevelArena::new(&inputs, 5);
        let a = Tensor::zeros((1, 4, 4, 4), DType::F32, &device).unwrap();
        let b = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        arena.push(4, a).unwrap();
        arena.push(4, b.clone()).unwrap();
        assert_eq!(arena.len(), 5);
        assert!(arena.push(3, b.clone()).is_err());
        assert!(arena.push(9, b.clone()).is_err());

        let out = arena.into_pyramid().unwrap();
        assert_eq!(max_abs_diff(out.level(4).unwrap(), &b), 0.0);
        assert_eq!(max_abs_diff(out.level(3).unwrap(), inputs.level(3).unwrap()), 0.0);
    }

    #[test]
    fn test_arena_rejects_unproduced_offset() {
        let inputs = random_pyramid(&[4, 4], 8);
        let arena = LevelArena::new(&inputs, 4);
        assert!(arena.get(1).is_ok());
        assert!(matches!(arena.get(2), Err(EffDetError::Config(_))));
    }

    #[test]
    fn test_single_sum_node_cell() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        // level 5 fed by levels 4 and 6
        let config = small_config(sum_graph(vec![(5, vec![1, 3])]));
        let graph = config.fpn_graph().unwrap();
        let cell = FusionCell::load(vb, &graph, &[64; 5], &config).unwrap();

        let inputs = random_pyramid(&[64; 5], 16);
        let out = cell.forward(&inputs, false).unwrap();
        assert_eq!(out.len(), 5);

        for level in [3, 4, 6, 7] {
            assert_eq!(max_abs_diff(out.level(level).unwrap(), inputs.level(level).unwrap()), 0.0);
        }

        let l4 = pool_to(inputs.level(4).unwrap(), 4, 4, PoolingType::Max).unwrap();
        let l6 = inputs.level(6).unwrap().upsample_nearest2d(4, 4).unwrap();
        let node = &cell.nodes()[0];
        assert!(node.resamplers.iter().all(|r| !r.projects()));
        let expected = node.op_after_combine.forward(&(l4 + l6).unwrap(), false).unwrap();
        let got = out.level(5).unwrap();
        assert_eq!(got.dims(), &[1, 64, 4, 4]);
        assert!(max_abs_diff(got, &expected) < 1e-5);
    }

    #[test]
    fn test_later_node_shadows_earlier_one() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = small_config(sum_graph(vec![(5, vec![1, 3]), (5, vec![2, 5])]));
        let graph = config.fpn_graph().unwrap();
        let cell = FusionCell::load(vb, &graph, &[64; 5], &config).unwrap();

        let inputs = random_pyramid(&[64; 5], 16);
        let out = cell.forward(&inputs, false).unwrap();

        let first = cell.nodes()[0].forward(&LevelArena::new(&inputs, 7), false).unwrap();
        let fused = (inputs.level(5).unwrap() + &first).unwrap();
        let expected = cell.nodes()[1].op_after_combine.forward(&fused, false).unwrap();
        assert!(max_abs_diff(out.level(5).unwrap(), &expected) < 1e-5);
    }

    #[test]
    fn test_cell_rejects_wrong_level_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = small_config(sum_graph(vec![(5, vec![1, 3])]));
        let graph = config.fpn_graph().unwrap();
        let cell = FusionCell::load(vb, &graph, &[64; 5], &config).unwrap();
        let inputs = random_pyramid(&[64; 4], 16);
        assert!(matches!(cell.forward(&inputs, false), Err(EffDetError::Shape(_))));
    }

    #[test]
    fn test_bifpn_stack_projects_backbone_widths() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = ModelConfig {
            fpn_num_filters: 32,
            fpn_cell_repeats: 2,
            ..ModelConfig::default()
        };
        let channels = [40, 112, 320, 32, 32];
        let stack = FusionStack::load(vb, &config, &channels).unwrap();
        assert_eq!(stack.cells().len(), 2);
        assert_eq!(stack.cells()[0].nodes().len(), 8);

        let out = stack.forward(random_pyramid(&channels, 32), false).unwrap();
        let shapes = out.shapes().unwrap();
        assert_eq!(shapes, vec![(32, 32, 32), (32, 16, 16), (32, 8, 8), (32, 4, 4), (32, 2, 2)]);
    }

    #[test]
    fn test_attention_nodes_allocate_edge_weights() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = ModelConfig {
            fpn_num_filters: 16,
            fpn_cell_repeats: 1,
            fpn_weight_method: WeightMethod::ChannelAttn,
            ..ModelConfig::default()
        };
        let stack = FusionStack::load(vb, &config, &[16; 5]).unwrap();
        let node = &stack.cells()[0].nodes()[4];
        assert_eq!(node.edge_weights().len(), 3);
        assert_eq!(node.edge_weights()[0].dims(), &[16]);

        let out = stack.forward(random_pyramid(&[16; 5], 16), false).unwrap();
        assert_eq!(out.len(), 5);
    }
}
