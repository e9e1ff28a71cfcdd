use thiserror::Error;

#[derive(Error, Debug)]
pub enum KgslError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid device state: {0}")]
    State(String),

    #[error("Device Error: {0}")]
    Device(String),

    #[error("Operation timed out")]
    WaitTimeout,
}

impl KgslError {
    /// The errno the ioctl layer hands back to user space for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) | Self::NotFound(_) | Self::State(_) => libc::EINVAL,
            Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::Device(_) => libc::EIO,
            Self::WaitTimeout => libc::ETIMEDOUT,
        }
    }
}

// A convenient alias
pub type KgslResult<T> = Result<T, KgslError>;
