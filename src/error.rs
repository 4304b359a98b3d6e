use thiserror::Error;

/// Domain errors raised by the deblurring engine.
///
/// They travel through `anyhow` and can be recovered with
/// `err.downcast_ref::<DeblurError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeblurError {
    /// Invalid configuration or a dataset that cannot satisfy it. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input and ground-truth streams disagree on a sampled frame.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// A tensor does not have the shape its consumer requires.
    #[error("dimension error: {0}")]
    Dimension(String),
}

impl DeblurError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn dimension(msg: impl Into<String>) -> Self {
        Self::Dimension(msg.into())
    }
}
