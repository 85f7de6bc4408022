// Turns raw head outputs into scored, class-labelled boxes.

use {
    crate::{
        anchors::{Anchors, BoxYxyx, decode_box},
        config::PostprocessConfig,
        error::EffDetError,
    },
    candle_core::Tensor,
    std::{cmp::Ordering, str::FromStr},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostMode {
    /// Return raw head outputs.
    None,
    /// One top-k over all classes, then class-aware NMS.
    #[default]
    Global,
    /// Top-k and NMS for each class separately.
    PerClass,
}

impl FromStr for PostMode {
    type Err = EffDetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(PostMode::None),
            "global" => Ok(PostMode::Global),
            "per_class" => Ok(PostMode::PerClass),
            other => Err(EffDetError::Config(format!("unsupported postprocess mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// `[y_min, x_min, y_max, x_max]` in original image pixels.
    pub bbox: BoxYxyx,
    pub score: f32,
    /// Zero-based class index.
    pub class_id: usize,
}

pub type Detections = Vec<Detection>;

/// Concatenates per-level `[b, k * width, h, w]` maps into `[b, anchors, width]`.
pub fn flatten_outputs(outputs: &[Tensor], width: usize) -> Result<Tensor, EffDetError> {
    let levels = outputs
        .iter()
        .map(|xs| {
            let (b, c, h, w) = xs.dims4()?;
            if c % width != 0 {
                return Err(EffDetError::Shape(format!(
                    "head output has {c} channels, not a multiple of {width}"
                )));
            }
            Ok(xs.permute((0, 2, 3, 1))?.reshape((b, h * w * (c / width), width))?)
        })
        .collect::<Result<Vec<_>, EffDetError>>()?;
    Ok(Tensor::cat(&levels, 1)?)
}

pub fn iou(a: &BoxYxyx, b: &BoxYxyx) -> f32 {
    let ih = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iw = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ih * iw;
    let area = |r: &BoxYxyx| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn by_score_desc(a: &Detection, b: &Detection) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Greedy NMS. Boxes of different classes never suppress each other.
pub fn nms(mut candidates: Vec<Detection>, iou_threshold: f32, max_detections: usize) -> Detections {
    candidates.sort_by(by_score_desc);
    let mut kept: Detections = Vec::new();
    for candidate in candidates {
        if kept.len() == max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Indices of the `k` largest values, best first.
fn top_k(values: impl Iterator<Item = (usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    let mut all: Vec<(usize, f32)> = values.collect();
    let by_value = |a: &(usize, f32), b: &(usize, f32)| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal);
    if all.len() > k && k > 0 {
        all.select_nth_unstable_by(k - 1, by_value);
        all.truncate(k);
    }
    all.sort_by(by_value);
    all
}

fn scaled(bbox: BoxYxyx, scale: f32) -> BoxYxyx {
    bbox.map(|v| v * scale)
}

/// Decodes one image. `logits` is `[anchors * num_classes]` row-major,
/// `codes` is `[anchors * 4]`.
fn select_image(
    logits: &[f32],
    codes: &[f32],
    anchors: &Anchors,
    num_classes: usize,
    scale: f32,
    mode: PostMode,
    config: &PostprocessConfig,
) -> Detections {
    let candidate = |index: usize, score: f32| {
        let anchor_id = index / num_classes;
        let code = [
            codes[anchor_id * 4],
            codes[anchor_id * 4 + 1],
            codes[anchor_id * 4 + 2],
            codes[anchor_id * 4 + 3],
        ];
        Detection {
            bbox: scaled(decode_box(&anchors.boxes()[anchor_id], &code), scale),
            score,
            class_id: index % num_classes,
        }
    };
    let above = |&(_, score): &(usize, f32)| score >= config.score_threshold;

    match mode {
        PostMode::None => Vec::new(),
        PostMode::Global => {
            let scores = logits.iter().enumerate().map(|(i, &x)| (i, sigmoid(x)));
            let candidates = top_k(scores, config.max_detection_points)
                .into_iter()
                .filter(above)
                .map(|(i, s)| candidate(i, s))
                .collect();
            nms(candidates, config.iou_threshold, config.max_detections)
        }
        PostMode::PerClass => {
            let mut merged = Vec::new();
            for class_id in 0..num_classes {
                let scores = logits
                    .iter()
                    .enumerate()
                    .skip(class_id)
                    .step_by(num_classes)
                    .map(|(i, &x)| (i, sigmoid(x)));
                let candidates = top_k(scores, config.max_detection_points)
                    .into_iter()
                    .filter(above)
                    .map(|(i, s)| candidate(i, s))
                    .collect();
                merged.extend(nms(candidates, config.iou_threshold, config.max_detections));
            }
            merged.sort_by(by_score_desc);
            merged.truncate(config.max_detections);
            merged
        }
    }
}

/// Scores, decodes and selects detections for every image of the batch.
///
/// `scales[i]` maps network-input pixels of image `i` back to the original image.
pub fn postprocess(
    class_outputs: &[Tensor],
    box_outputs: &[Tensor],
    anchors: &Anchors,
    num_classes: usize,
    scales: &[f32],
    mode: PostMode,
    config: &PostprocessConfig,
) -> Result<Vec<Detections>, EffDetError> {
    let classes = flatten_outputs(class_outputs, num_classes)?;
    let boxes = flatten_outputs(box_outputs, 4)?;
    let (batch, num_anchors, _) = classes.dims3()?;
    if num_anchors != anchors.len() || boxes.dim(1)? != num_anchors {
        return Err(EffDetError::Shape(format!(
            "{} anchors for {num_anchors} class rows and {} box rows",
            anchors.len(),
            boxes.dim(1)?
        )));
    }
    if scales.len() != batch {
        return Err(EffDetError::Shape(format!("{} scales for a batch of {batch}", scales.len())));
    }

    let classes = classes.to_dtype(candle_core::DType::F32)?;
    let boxes = boxes.to_dtype(candle_core::DType::F32)?;
    (0..batch)
        .map(|i| {
            let logits: Vec<f32> = classes.get(i)?.flatten_all()?.to_vec1()?;
            let codes: Vec<f32> = boxes.get(i)?.flatten_all()?.to_vec1()?;
            Ok(select_image(&logits, &codes, anchors, num_classes, scales[i], mode, config))
        })
        .collect()
}
