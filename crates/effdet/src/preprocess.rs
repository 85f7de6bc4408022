use {
    crate::{config::ModelConfig, error::EffDetError},
    base::Frame,
    candle_core::{DType, Device, Tensor},
    std::str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreMode {
    /// Input is already a network-ready NCHW batch.
    None,
    /// Input is raw NHWC RGB pixels in 0-255.
    #[default]
    Infer,
}

impl FromStr for PreMode {
    type Err = EffDetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(PreMode::None),
            "infer" => Ok(PreMode::Infer),
            other => Err(EffDetError::Config(format!("unsupported preprocess mode '{other}'"))),
        }
    }
}

/// Size of an `(h, w)` image scaled to fit inside `target` with its aspect
/// ratio kept, plus the factor mapping it back.
pub fn letterbox_geometry(hw: (usize, usize), target: (usize, usize)) -> ((usize, usize), f32) {
    let scale = (target.0 as f32 / hw.0 as f32).min(target.1 as f32 / hw.1 as f32);
    let scaled_h = ((hw.0 as f32 * scale).round() as usize).clamp(1, target.0);
    let scaled_w = ((hw.1 as f32 * scale).round() as usize).clamp(1, target.1);
    ((scaled_h, scaled_w), 1.0 / scale)
}

/// Normalizes, resizes and pads one `[h, w, 3]` image into `[1, 3, H, W]`.
///
/// Returns the batch and the factor that maps network pixels back to the
/// original image.
pub fn preprocess_image(image: &Tensor, config: &ModelConfig) -> Result<(Tensor, f32), EffDetError> {
    let (h, w, c) = image.dims3()?;
    if h == 0 || w == 0 {
        return Err(EffDetError::Shape(format!("image dimensions must be non-zero, got {h}x{w}")));
    }
    if c != 3 {
        return Err(EffDetError::Shape(format!("expected 3 channels (RGB), got {c}")));
    }
    let device = image.device();
    let mean = Tensor::new(&config.mean_rgb, device)?.reshape((3, 1, 1))?;
    let stddev = Tensor::new(&config.stddev_rgb, device)?.reshape((3, 1, 1))?;

    let chw = image.to_dtype(DType::F32)?.permute((2, 0, 1))?;
    let normalized = chw.broadcast_sub(&mean)?.broadcast_div(&stddev)?.unsqueeze(0)?;

    let (target_h, target_w) = config.image_size;
    let ((scaled_h, scaled_w), scale_to_original) = letterbox_geometry((h, w), (target_h, target_w));
    let resized = if (scaled_h, scaled_w) != (h, w) {
        normalized.upsample_nearest2d(scaled_h, scaled_w)?
    } else {
        normalized
    };
    let padded = resized
        .pad_with_zeros(2, 0, target_h - scaled_h)?
        .pad_with_zeros(3, 0, target_w - scaled_w)?;
    Ok((padded, scale_to_original))
}

/// Preprocesses every image of an `[b, h, w, 3]` batch.
pub fn preprocess_batch(images: &Tensor, config: &ModelConfig) -> Result<(Tensor, Vec<f32>), EffDetError> {
    let batch = images.dim(0)?;
    let mut tensors = Vec::with_capacity(batch);
    let mut scales = Vec::with_capacity(batch);
    for i in 0..batch {
        let (tensor, scale) = preprocess_image(&images.get(i)?, config)?;
        tensors.push(tensor);
        scales.push(scale);
    }
    Ok((Tensor::cat(&tensors, 0)?, scales))
}

/// Copies a frame into an `[1, h, w, 3]` f32 tensor of raw pixel values.
pub fn frame_to_tensor(frame: &Frame, device: &Device) -> Result<Tensor, EffDetError> {
    let data: Vec<f32> = frame.data().iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(data, (1, frame.height(), frame.width(), Frame::CHANNELS), device)?)
}
