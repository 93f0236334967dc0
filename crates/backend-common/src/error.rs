use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InternalError(_) => "InternalError",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Io(_) => "InternalError",
        }
    }
}

impl From<std::fmt::Error> for BackendError {
    fn from(_: std::fmt::Error) -> Self {
        Self::InternalError("failed to format metrics output".to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::BackendError;

    #[test]
    fn io_errors_map_to_internal_code() {
        let err: BackendError = std::io::Error::other("disk gone").into();
        assert_eq!(err.error_code(), "InternalError");
        assert_eq!(err.to_string(), "disk gone");
    }

    #[test]
    fn invalid_argument_keeps_message() {
        let err = BackendError::InvalidArgument("metric already registered: x".to_string());
        assert_eq!(err.error_code(), "InvalidArgument");
        assert_eq!(err.to_string(), "invalid argument: metric already registered: x");
    }
}
