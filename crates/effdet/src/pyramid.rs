use {crate::error::EffDetError, candle_core::Tensor};

/// Feature maps for a contiguous range of pyramid levels, finest first.
///
/// Every map is an NCHW tensor; level `l + 1` has half the spatial
/// resolution of level `l`.
#[derive(Debug, Clone)]
pub struct Pyramid {
    min_level: usize,
    maps: Vec<Tensor>,
}

impl Pyramid {
    pub fn new(min_level: usize, maps: Vec<Tensor>) -> Result<Self, EffDetError> {
        if maps.is_empty() {
            return Err(EffDetError::Shape("pyramid needs at least one level".to_string()));
        }
        for (i, map) in maps.iter().enumerate() {
            if map.rank() != 4 {
                return Err(EffDetError::Shape(format!(
                    "level {} must be an NCHW tensor, got shape {:?}",
                    min_level + i,
                    map.dims()
                )));
            }
        }
        Ok(Self { min_level, maps })
    }

    pub fn min_level(&self) -> usize {
        self.min_level
    }

    pub fn max_level(&self) -> usize {
        self.min_level + self.maps.len() - 1
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn level(&self, level: usize) -> Option<&Tensor> {
        level
            .checked_sub(self.min_level)
            .and_then(|i| self.maps.get(i))
    }

    pub fn maps(&self) -> &[Tensor] {
        &self.maps
    }

    pub fn into_maps(self) -> Vec<Tensor> {
        self.maps
    }

    pub fn push(&mut self, map: Tensor) {
        self.maps.push(map);
    }

    /// Levels `[lo, hi]` of this pyramid; `hi` is clamped to the top level.
    pub fn slice(&self, lo: usize, hi: usize) -> Result<Self, EffDetError> {
        if lo < self.min_level || lo > self.max_level() {
            return Err(EffDetError::Shape(format!(
                "level {lo} is not in pyramid [{}, {}]",
                self.min_level,
                self.max_level()
            )));
        }
        let hi = hi.min(self.max_level());
        let maps = self.maps[lo - self.min_level..=hi - self.min_level].to_vec();
        Self::new(lo, maps)
    }

    /// `(channels, height, width)` per level.
    pub fn shapes(&self) -> Result<Vec<(usize, usize, usize)>, EffDetError> {
        self.maps
            .iter()
            .map(|m| {
                let (_b, c, h, w) = m.dims4()?;
                Ok((c, h, w))
            })
            .collect()
    }
}
