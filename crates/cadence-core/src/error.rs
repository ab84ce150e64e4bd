use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

impl CadenceError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidSetting { .. } => "INVALID_SETTING",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
