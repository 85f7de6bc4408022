// Rescales a feature map to another pyramid level's resolution and width.

use {
    super::blocks::norm_layer,
    crate::{
        config::{ModelConfig, PoolingType},
        error::EffDetError,
    },
    candle_core::{DType, Tensor},
    candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, conv2d},
};

/// Stride, kernel and padding for pooling `size` down to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub stride: usize,
    pub kernel: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

impl PoolGeometry {
    /// Padding makes the pooled extent at least `target`; the caller crops the rest.
    pub fn new(size: usize, target: usize) -> Self {
        let stride = (size.saturating_sub(1)).div_ceil(target.max(1)).max(1);
        let kernel = stride + 1;
        let padded = (target.max(1) - 1) * stride + kernel;
        let total = padded.saturating_sub(size);
        let pad_before = total / 2;
        Self {
            stride,
            kernel,
            pad_before,
            pad_after: total - pad_before,
        }
    }

    pub fn output_size(&self, size: usize) -> usize {
        (size + self.pad_before + self.pad_after - self.kernel) / self.stride + 1
    }
}

/// Pools an NCHW map down to exactly `(target_h, target_w)`.
///
/// Max pooling pads by edge replication; average pooling excludes padded cells
/// from each window's count.
pub fn pool_to(xs: &Tensor, target_h: usize, target_w: usize, pooling: PoolingType) -> Result<Tensor, EffDetError> {
    let (_b, _c, h, w) = xs.dims4()?;
    let gh = PoolGeometry::new(h, target_h);
    let gw = PoolGeometry::new(w, target_w);
    let kernel = (gh.kernel, gw.kernel);
    let stride = (gh.stride, gw.stride);

    let pooled = match pooling {
        PoolingType::Max => xs
            .pad_with_same(2, gh.pad_before, gh.pad_after)?
            .pad_with_same(3, gw.pad_before, gw.pad_after)?
            .max_pool2d_with_stride(kernel, stride)?,
        PoolingType::Avg => {
            let sums = xs
                .pad_with_zeros(2, gh.pad_before, gh.pad_after)?
                .pad_with_zeros(3, gw.pad_before, gw.pad_after)?
                .avg_pool2d_with_stride(kernel, stride)?;
            let counts = Tensor::ones((1, 1, h, w), DType::F32, xs.device())?
                .to_dtype(xs.dtype())?
                .pad_with_zeros(2, gh.pad_before, gh.pad_after)?
                .pad_with_zeros(3, gw.pad_before, gw.pad_after)?
                .avg_pool2d_with_stride(kernel, stride)?
                .maximum(1e-6)?;
            sums.broadcast_div(&counts)?
        }
    };
    Ok(pooled.narrow(2, 0, target_h)?.narrow(3, 0, target_w)?)
}

/// Resamples one feature map to a target resolution and channel width.
#[derive(Debug)]
pub struct Resampler {
    projection: Option<Conv2d>,
    bn: Option<BatchNorm>,
    conv_after_downsample: bool,
    pooling: PoolingType,
}

impl Resampler {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        target_channels: usize,
        config: &ModelConfig,
    ) -> Result<Self, EffDetError> {
        let (projection, bn) = if in_channels != target_channels {
            let conv = conv2d(in_channels, target_channels, 1, Conv2dConfig::default(), vb.pp("conv2d"))?;
            let bn = if config.apply_bn_for_resampling {
                Some(norm_layer(target_channels, config.batch_norm_eps, vb.pp("bn"))?)
            } else {
                None
            };
            (Some(conv), bn)
        } else {
            (None, None)
        };
        Ok(Self {
            projection,
            bn,
            conv_after_downsample: config.conv_after_downsample,
            pooling: config.pooling_type,
        })
    }

    pub fn projects(&self) -> bool {
        self.projection.is_some()
    }

    fn maybe_project(&self, xs: Tensor, train: bool) -> Result<Tensor, EffDetError> {
        let Some(conv) = &self.projection else {
            return Ok(xs);
        };
        let xs = xs.apply(conv)?;
        match &self.bn {
            Some(bn) => Ok(xs.apply_t(bn, train)?),
            None => Ok(xs),
        }
    }

    /// Resamples `xs` to `target` (height, width). Without a target the map
    /// is downsampled by two, rounding up.
    pub fn forward(&self, xs: &Tensor, target: Option<(usize, usize)>, train: bool) -> Result<Tensor, EffDetError> {
        let (_b, _c, h, w) = xs.dims4()?;
        let (th, tw) = target.unwrap_or(((h + 1) / 2, (w + 1) / 2));

        if h > th && w > tw {
            let mut xs = xs.clone();
            if !self.conv_after_downsample {
                xs = self.maybe_project(xs, train)?;
            }
            xs = pool_to(&xs, th, tw, self.pooling)?;
            if self.conv_after_downsample {
                xs = self.maybe_project(xs, train)?;
            }
            Ok(xs)
        } else if h <= th && w <= tw {
            let xs = self.maybe_project(xs.clone(), train)?;
            if h < th || w < tw {
                Ok(xs.upsample_nearest2d(th, tw)?)
            } else {
                Ok(xs)
            }
        } else {
            Err(EffDetError::Shape(format!(
                "incompatible resampling: feature {h}x{w}, target {th}x{tw}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn ramp(c: usize, h: usize, w: usize) -> Tensor {
        Tensor::arange(0f32, (c * h * w) as f32, &Device::Cpu)
            .unwrap()
            .reshape((1, c, h, w))
            .unwrap()
    }

    #[test]
    fn test_pool_geometry_covers_target() {
        for (size, target) in [(64, 32), (65, 33), (9, 4), (12, 10), (7, 3), (100, 13), (3, 2), (2, 1)] {
            let g = PoolGeometry::new(size, target);
            assert_eq!(g.kernel, g.stride + 1);
            assert_eq!(g.stride, ((size - 1) as f64 / target as f64).ceil() as usize);
            assert!(g.output_size(size) >= target, "{size} -> {target}");
        }
    }

    #[test]
    fn test_pool_to_exact_target() {
        for pooling in [PoolingType::Max, PoolingType::Avg] {
            for (size, target) in [(64, 32), (65, 33), (9, 4), (12, 10), (7, 3), (5, 1)] {
                let xs = ramp(2, size, size + 1);
                let out = pool_to(&xs, target, target, pooling).unwrap();
                assert_eq!(out.dims(), &[1, 2, target, target]);
            }
        }
    }

    #[test]
    fn test_max_pool_values() {
        // 4x4 ramp pooled to 2x2: stride 2, kernel 3, one padded row/col after
        let xs = ramp(1, 4, 4);
        let out = pool_to(&xs, 2, 2, PoolingType::Max).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let xs = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let out = pool_to(&xs, 2, 2, PoolingType::Avg).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_resampler_downsample_projects_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig::default();

        let resampler = Resampler::load(vb, 40, 64, &config).unwrap();
        assert!(resampler.projects());
        let out = resampler.forward(&ramp(40, 16, 16), None, false).unwrap();
        assert_eq!(out.dims(), &[1, 64, 8, 8]);

        let odd = resampler.forward(&ramp(40, 15, 15), None, false).unwrap();
        assert_eq!(odd.dims(), &[1, 64, 8, 8]);
    }

    #[test]
    fn test_resampler_upsample_and_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig::default();

        let resampler = Resampler::load(vb, 8, 8, &config).unwrap();
        assert!(!resampler.projects());

        let xs = ramp(8, 4, 4);
        let up = resampler.forward(&xs, Some((8, 8)), false).unwrap();
        assert_eq!(up.dims(), &[1, 8, 8, 8]);

        let same = resampler.forward(&xs, Some((4, 4)), false).unwrap();
        let diff: f32 = (same - &xs).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_resampler_conv_after_downsample() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig {
            conv_after_downsample: true,
            pooling_type: PoolingType::Avg,
            ..ModelConfig::default()
        };

        let resampler = Resampler::load(vb, 16, 32, &config).unwrap();
        let out = resampler.forward(&ramp(16, 10, 10), Some((5, 5)), false).unwrap();
        assert_eq!(out.dims(), &[1, 32, 5, 5]);
    }

    #[test]
    fn test_resampler_rejects_mixed_relation() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let resampler = Resampler::load(vb, 4, 4, &ModelConfig::default()).unwrap();

        let err = resampler.forward(&ramp(4, 8, 4), Some((4, 8)), false).unwrap_err();
        assert!(matches!(err, EffDetError::Shape(_)));
    }
}
