use std::fmt;

#[derive(Debug)]
pub enum EffDetError {
    /// Invalid model configuration: unknown names, bad level ranges, broken topologies.
    Config(String),
    /// Tensors whose dimensions cannot be reconciled.
    Shape(String),
    Candle(String),
    Io(String),
    Runtime(String),
}

impl fmt::Display for EffDetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffDetError::Config(msg) => write!(f, "configuration error: {msg}"),
            EffDetError::Shape(msg) => write!(f, "shape mismatch: {msg}"),
            EffDetError::Candle(msg) => write!(f, "candle error: {msg}"),
            EffDetError::Io(msg) => write!(f, "io error: {msg}"),
            EffDetError::Runtime(msg) => write!(f, "runtime error: {msg}"),
        }
    }
}

impl std::error::Error for EffDetError {}

impl From<candle_core::Error> for EffDetError {
    fn from(err: candle_core::Error) -> Self {
        EffDetError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for EffDetError {
    fn from(err: std::io::Error) -> Self {
        EffDetError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EffDetError {
    fn from(err: serde_json::Error) -> Self {
        EffDetError::Config(format!("invalid config json: {err}"))
    }
}

impl From<base::FrameError> for EffDetError {
    fn from(err: base::FrameError) -> Self {
        EffDetError::Shape(err.to_string())
    }
}
