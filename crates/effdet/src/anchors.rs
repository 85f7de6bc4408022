use crate::{config::ModelConfig, error::EffDetError};

/// Axis-aligned box as `[y_min, x_min, y_max, x_max]`.
pub type BoxYxyx = [f32; 4];

/// Spatial size of every level from 0 (the image) to `max_level`.
pub fn feat_sizes(image_hw: (usize, usize), max_level: usize) -> Vec<(usize, usize)> {
    let mut sizes = vec![image_hw];
    for _ in 0..max_level {
        let (h, w) = sizes[sizes.len() - 1];
        sizes.push(((h + 1) / 2, (w + 1) / 2));
    }
    sizes
}

/// Anchor boxes for every level, location and (octave, aspect) pair.
///
/// Ordered level by level, then row, column and anchor, which matches the
/// flattened head outputs.
#[derive(Debug, Clone)]
pub struct Anchors {
    image_hw: (usize, usize),
    level_hw: Vec<(usize, usize)>,
    boxes: Vec<BoxYxyx>,
}

impl Anchors {
    /// Anchors for heads that produced maps of `level_hw` (finest first) on an
    /// input of `image_hw`.
    pub fn new(config: &ModelConfig, image_hw: (usize, usize), level_hw: &[(usize, usize)]) -> Result<Self, EffDetError> {
        if level_hw.iter().any(|&(h, w)| h == 0 || w == 0) || image_hw.0 == 0 || image_hw.1 == 0 {
            return Err(EffDetError::Shape(format!(
                "anchors need non-empty sizes, image {image_hw:?}, levels {level_hw:?}"
            )));
        }
        let mut configs = Vec::with_capacity(config.num_anchors());
        for octave in 0..config.num_scales {
            let octave_scale = 2f32.powf(octave as f32 / config.num_scales as f32);
            for &ratio in &config.aspect_ratios {
                let r = (ratio as f32).sqrt();
                configs.push((octave_scale, (r, 1.0 / r)));
            }
        }

        let mut boxes = Vec::new();
        for &(fh, fw) in level_hw {
            let stride_y = image_hw.0 as f32 / fh as f32;
            let stride_x = image_hw.1 as f32 / fw as f32;
            for i in 0..fh {
                let cy = stride_y / 2.0 + i as f32 * stride_y;
                for j in 0..fw {
                    let cx = stride_x / 2.0 + j as f32 * stride_x;
                    for &(octave_scale, (ax, ay)) in &configs {
                        let base = config.anchor_scale as f32 * octave_scale;
                        let half_h = base * stride_y * ay / 2.0;
                        let half_w = base * stride_x * ax / 2.0;
                        boxes.push([cy - half_h, cx - half_w, cy + half_h, cx + half_w]);
                    }
                }
            }
        }

        Ok(Self {
            image_hw,
            level_hw: level_hw.to_vec(),
            boxes,
        })
    }

    /// Anchors for the configured input size.
    pub fn from_config(config: &ModelConfig) -> Result<Self, EffDetError> {
        let sizes = feat_sizes(config.image_size, config.max_level);
        Self::new(config, config.image_size, &sizes[config.min_level..=config.max_level])
    }

    pub fn matches(&self, image_hw: (usize, usize), level_hw: &[(usize, usize)]) -> bool {
        self.image_hw == image_hw && self.level_hw == level_hw
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn boxes(&self) -> &[BoxYxyx] {
        &self.boxes
    }
}

/// Applies Faster-RCNN box deltas `[ty, tx, th, tw]` to an anchor.
pub fn decode_box(anchor: &BoxYxyx, code: &[f32; 4]) -> BoxYxyx {
    let ha = anchor[2] - anchor[0];
    let wa = anchor[3] - anchor[1];
    let yc = code[0] * ha + anchor[0] + ha / 2.0;
    let xc = code[1] * wa + anchor[1] + wa / 2.0;
    let h = code[2].exp() * ha;
    let w = code[3].exp() * wa;
    [yc - h / 2.0, xc - w / 2.0, yc + h / 2.0, xc + w / 2.0]
}
