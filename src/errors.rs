use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("TEMPLATE_NOT_FOUND: {0}")]
    TemplateNotFound(String),
    #[error("SANDBOX_VIOLATION: {0}")]
    SandboxViolation(String),
    #[error("RENDER_FAILED: {0}")]
    Render(String),
    #[error("MIGRATION_ABORTED: {0}")]
    MigrationAborted(String),
    #[error("MIGRATION_FAILED: {0}")]
    MigrationFailed(String),
    #[error("CONFIGURATION_MISSING: {0}")]
    ConfigurationMissing(String),
    #[error("INVALID_CONFIGURATION: {0}")]
    InvalidConfiguration(String),
    #[error("INVALID_VERSION: {0}")]
    InvalidVersion(String),
    #[error("UNSUPPORTED_DRIVER: {0}")]
    UnsupportedDriver(String),
    #[error("EXTENSION_FAILED: {0}")]
    Extension(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP-class status a request-scoped failure is reported as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TemplateNotFound(_) => 404,
            _ => 500,
        }
    }

    /// Process exit code for a failure that terminates startup.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigurationMissing(_) | Self::InvalidConfiguration(_) => 2,
            Self::MigrationAborted(_) => 3,
            Self::MigrationFailed(_) => 4,
            _ => 1,
        }
    }

    /// Wraps anything that is not already a migration failure as one, keeping
    /// aborts distinct.
    pub fn into_migration_failure(self) -> Self {
        match self {
            Self::MigrationFailed(_) | Self::MigrationAborted(_) => self,
            other => Self::MigrationFailed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
