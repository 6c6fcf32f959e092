use thiserror::Error;

pub type MirrorResult<T> = Result<T, MirrorError>;

/// How a failure should be handled by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry with bounded backoff
    Transient,
    /// Fails the single operation; the process continues
    Terminal,
    /// The process cannot continue
    Fatal,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("hydration error: {0}")]
    Hydration(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("sync root connection error: {0}")]
    Connection(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MirrorError {
    pub fn severity(&self) -> Severity {
        match self {
            MirrorError::Connection(_) | MirrorError::Config(_) => Severity::Fatal,
            MirrorError::Storage(_) => Severity::Transient,
            _ => Severity::Terminal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
