pub mod frame;
pub mod logging;

pub use frame::{Frame, FrameError};
pub use logging::{FileLogger, StdoutLogger, init_file_logger, init_stdout_logger};

pub use log;
