use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    Empty { width: usize, height: usize },
    SizeMismatch { expected: usize, got: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty { width, height } => {
                write!(f, "frame dimensions must be non-zero, got {width}x{height}")
            }
            FrameError::SizeMismatch { expected, got } => {
                write!(f, "frame data length mismatch: expected {expected} bytes, got {got}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Interleaved RGB8 image, rows top to bottom (HWC).
#[derive(Clone, PartialEq)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(Self::CHANNELS))
            .ok_or(FrameError::SizeMismatch {
                expected: usize::MAX,
                got: data.len(),
            })?;
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    /// Frame of a single color.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Result<Self, FrameError> {
        let data = rgb.iter().copied().cycle().take(width * height * Self::CHANNELS).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) * Self::CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}
