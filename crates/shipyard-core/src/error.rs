use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShipyardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipyardError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            ShipyardError::Config(_) => "CONFIG_ERROR",
            ShipyardError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShipyardError>;
