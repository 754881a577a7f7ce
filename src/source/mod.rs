use std::fmt;

use crate::frame::Frame;

mod video_file;

pub use video_file::VideoFileSource;

/// Errors raised while opening a frame source. Fatal for the affected
/// source only; siblings keep running.
#[derive(Debug)]
pub enum SourceError {
    OpenFailed { locator: String, detail: String },
    Io(std::io::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::OpenFailed { locator, detail } => {
                write!(f, "failed to open feed '{locator}': {detail}")
            }
            SourceError::Io(err) => write!(f, "source i/o error: {err}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(value: std::io::Error) -> Self {
        SourceError::Io(value)
    }
}

/// Pluggable frame producer. Implementations run their own decode loop and
/// expose the most recent frame through a non-blocking, lock-protected cell.
pub trait FrameSource: Send + Sync {
    /// Open the underlying feed and begin decoding. Must not panic; a feed
    /// that cannot be opened is reported as an error.
    fn start(&self) -> Result<(), SourceError>;

    /// Release resources. Idempotent.
    fn stop(&self);

    /// Resume sampling.
    fn play(&self);

    /// Suspend sampling; the decode loop sleeps until resumed.
    fn pause(&self);

    /// Most recently decoded frame, or `None` if nothing has been decoded
    /// yet. Never blocks on decoding.
    fn snapshot(&self) -> Option<Frame>;
}
