// Fusion cell topologies.
//
// Offsets index the cell arena: offsets 0..num_levels are the cell inputs in
// increasing level order, offset num_levels + k is the output of node k.

use {
    crate::{config::WeightMethod, error::EffDetError},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FpnName {
    #[serde(rename = "bifpn")]
    BiFpn,
    #[serde(rename = "qufpn")]
    QuFpn,
}

impl FpnName {
    /// Topology over `[min_level, max_level]`. Cross-scale fusion needs at
    /// least two levels.
    pub fn graph(
        &self,
        min_level: usize,
        max_level: usize,
        weight_method: WeightMethod,
    ) -> Result<FusionGraphSpec, EffDetError> {
        if max_level <= min_level {
            return Err(EffDetError::Config(format!(
                "{self:?} needs at least two levels, got [{min_level}, {max_level}]"
            )));
        }
        Ok(match self {
            FpnName::BiFpn => bifpn(min_level, max_level, weight_method),
            FpnName::QuFpn => qufpn(min_level, max_level, weight_method),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FusionNodeSpec {
    #[serde(alias = "feat_level")]
    pub level: usize,
    pub inputs_offsets: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_method: Option<WeightMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FusionGraphSpec {
    pub weight_method: WeightMethod,
    pub nodes: Vec<FusionNodeSpec>,
}

impl FusionGraphSpec {
    pub fn node_weight_method(&self, node: &FusionNodeSpec) -> WeightMethod {
        node.weight_method.unwrap_or(self.weight_method)
    }

    /// Checks that every node targets a level in range and only reads
    /// inputs or nodes produced before it.
    pub fn validate(&self, min_level: usize, max_level: usize) -> Result<(), EffDetError> {
        if self.nodes.is_empty() {
            return Err(EffDetError::Config("fusion graph has no nodes".to_string()));
        }
        let num_levels = max_level
            .checked_sub(min_level)
            .map(|span| span + 1)
            .ok_or_else(|| EffDetError::Config(format!("max_level {max_level} is below min_level {min_level}")))?;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.level < min_level || node.level > max_level {
                return Err(EffDetError::Config(format!(
                    "fusion node {i} targets level {} outside [{min_level}, {max_level}]",
                    node.level
                )));
            }
            if node.inputs_offsets.is_empty() {
                return Err(EffDetError::Config(format!("fusion node {i} has no inputs")));
            }
            if let Some(&offset) = node.inputs_offsets.iter().find(|&&o| o >= num_levels + i) {
                return Err(EffDetError::Config(format!(
                    "fusion node {i} reads offset {offset}, only {} entries exist before it",
                    num_levels + i
                )));
            }
        }
        Ok(())
    }

    /// Number of arena entries a cell produces in total.
    pub fn arena_len(&self, num_levels: usize) -> usize {
        num_levels + self.nodes.len()
    }
}

/// Tracks the arena ids produced at each level while a topology is laid out.
struct NodeIds {
    ids: BTreeMap<usize, Vec<usize>>,
    next: usize,
}

impl NodeIds {
    fn new(min_level: usize, max_level: usize) -> Self {
        let ids = (min_level..=max_level)
            .enumerate()
            .map(|(i, level)| (level, vec![i]))
            .collect();
        Self {
            ids,
            next: max_level - min_level + 1,
        }
    }

    fn all(&self, level: usize) -> Vec<usize> {
        self.ids[&level].clone()
    }

    fn first(&self, level: usize) -> usize {
        self.ids[&level][0]
    }

    fn last(&self, level: usize) -> usize {
        *self.ids[&level].last().unwrap_or(&0)
    }

    fn nth(&self, level: usize, n: usize) -> usize {
        self.ids[&level][n]
    }

    fn produce(&mut self, level: usize) {
        let id = self.next;
        self.next += 1;
        self.ids.entry(level).or_default().push(id);
    }

    fn repeat_last(&mut self, level: usize) {
        let last = self.last(level);
        self.ids.entry(level).or_default().push(last);
    }
}

fn node(level: usize, inputs_offsets: Vec<usize>, weight_method: Option<WeightMethod>) -> FusionNodeSpec {
    FusionNodeSpec {
        level,
        inputs_offsets,
        weight_method,
    }
}

/// BiFPN: one top-down pass followed by one bottom-up pass.
pub fn bifpn(min_level: usize, max_level: usize, weight_method: WeightMethod) -> FusionGraphSpec {
    let mut ids = NodeIds::new(min_level, max_level);
    let mut nodes = Vec::new();

    for level in (min_level..max_level).rev() {
        nodes.push(node(level, vec![ids.last(level), ids.last(level + 1)], None));
        ids.produce(level);
    }

    for level in min_level + 1..=max_level {
        let mut inputs = ids.all(level);
        inputs.push(ids.last(level - 1));
        nodes.push(node(level, inputs, None));
        ids.produce(level);
    }

    FusionGraphSpec { weight_method, nodes }
}

/// QuFPN: two top-down and two bottom-up paths merged by a final
/// per-level node that always uses `fastattn`.
pub fn qufpn(min_level: usize, max_level: usize, weight_method: WeightMethod) -> FusionGraphSpec {
    let mut ids = NodeIds::new(min_level, max_level);
    let mut nodes = Vec::new();
    if max_level <= min_level {
        return FusionGraphSpec { weight_method, nodes };
    }

    // top-down path 1
    for level in (min_level..max_level).rev() {
        nodes.push(node(level, vec![ids.last(level), ids.last(level + 1)], None));
        ids.produce(level);
    }
    ids.repeat_last(max_level);

    // bottom-up path 2
    for level in min_level + 1..max_level {
        let mut inputs = ids.all(level);
        inputs.push(ids.last(level - 1));
        nodes.push(node(level, inputs, None));
        ids.produce(level);
    }
    nodes.push(node(max_level, vec![ids.first(max_level), ids.last(max_level - 1)], None));
    ids.produce(max_level);
    ids.repeat_last(min_level);

    // bottom-up path 3
    for level in min_level + 1..=max_level {
        let below = if level == min_level + 1 {
            ids.first(level - 1)
        } else {
            ids.last(level - 1)
        };
        nodes.push(node(level, vec![ids.first(level), below], None));
        ids.produce(level);
    }
    ids.repeat_last(min_level);

    // top-down path 4
    for level in (min_level + 1..max_level).rev() {
        let inputs = vec![ids.first(level), ids.last(level), ids.last(level + 1)];
        nodes.push(node(level, inputs, None));
        ids.produce(level);
    }
    nodes.push(node(min_level, vec![ids.first(min_level), ids.last(min_level + 1)], None));
    ids.produce(min_level);
    ids.repeat_last(max_level);

    // quad-add merge
    for level in (min_level..=max_level).rev() {
        let inputs = vec![ids.nth(level, 2), ids.nth(level, 4)];
        nodes.push(node(level, inputs, Some(WeightMethod::FastAttn)));
        ids.produce(level);
    }

    FusionGraphSpec { weight_method, nodes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bifpn_topology_levels_3_7() {
        let graph = bifpn(3, 7, WeightMethod::FastAttn);
        let expected: Vec<(usize, Vec<usize>)> = vec![
            (6, vec![3, 4]),
            (5, vec![2, 5]),
            (4, vec![1, 6]),
            (3, vec![0, 7]),
            (4, vec![1, 7, 8]),
            (5, vec![2, 6, 9]),
            (6, vec![3, 5, 10]),
            (7, vec![4, 11]),
        ];
        let got: Vec<(usize, Vec<usize>)> = graph
            .nodes
            .iter()
            .map(|n| (n.level, n.inputs_offsets.clone()))
            .collect();
        assert_eq!(got, expected);
        assert!(graph.validate(3, 7).is_ok());
    }

    #[test]
    fn test_qufpn_is_valid() {
        let graph = qufpn(3, 7, WeightMethod::Sum);
        assert!(graph.validate(3, 7).is_ok());
        // 4 + 3 + 1 + 4 + 3 + 1 + 5 nodes
        assert_eq!(graph.nodes.len(), 21);
        let last = graph.nodes.last().unwrap();
        assert_eq!(last.level, 3);
        assert_eq!(graph.node_weight_method(last), WeightMethod::FastAttn);
        assert_eq!(graph.node_weight_method(&graph.nodes[0]), WeightMethod::Sum);
    }

    #[test]
    fn test_validate_rejects_future_offset() {
        let graph = FusionGraphSpec {
            weight_method: WeightMethod::Sum,
            nodes: vec![node(5, vec![1, 5], None)],
        };
        let err = graph.validate(3, 7).unwrap_err();
        assert!(matches!(err, EffDetError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_level_out_of_range() {
        let graph = FusionGraphSpec {
            weight_method: WeightMethod::Sum,
            nodes: vec![node(8, vec![0], None)],
        };
        assert!(graph.validate(3, 7).is_err());
    }

    #[test]
    fn test_single_level_topologies_are_rejected() {
        for name in [FpnName::BiFpn, FpnName::QuFpn] {
            let err = name.graph(4, 4, WeightMethod::FastAttn).unwrap_err();
            assert!(matches!(err, EffDetError::Config(_)));
        }
        // direct builder calls stay empty instead of reading a missing level
        let graph = qufpn(3, 3, WeightMethod::Sum);
        assert!(graph.nodes.is_empty());
        assert!(graph.validate(3, 3).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_levels() {
        let graph = FusionGraphSpec {
            weight_method: WeightMethod::Sum,
            nodes: vec![node(5, vec![0], None)],
        };
        let err = graph.validate(6, 4).unwrap_err();
        assert!(err.to_string().contains("below min_level"));
    }

    #[test]
    fn test_graph_json_accepts_feat_level() {
        let json = r#"{"weight_method": "sum", "nodes": [{"feat_level": 5, "inputs_offsets": [1, 3]}]}"#;
        let graph: FusionGraphSpec = serde_json::from_str(json).unwrap();
        assert_eq!(graph.nodes[0].level, 5);
        assert_eq!(graph.nodes[0].weight_method, None);
    }
}
