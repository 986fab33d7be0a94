//! Error types for the embedding client

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Everything that can go wrong while turning text into vectors.
///
/// The variants follow how a caller should react:
///
/// - [`EmbedError::ServiceUnavailable`]: the service could not be reached or timed out.
///   Trying again later may succeed.
/// - [`EmbedError::BadRequest`]: the caller asked for something the service never
///   accepts (an empty batch, too many texts). Nothing was sent.
/// - [`EmbedError::ServiceError`]: the service answered with a non-2xx status.
/// - [`EmbedError::InvalidResponse`]: the service answered 2xx with a body that does not
///   match the request (wrong count, wrong dimension, undecodable JSON).
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Connection refused, DNS failure, timeout
    #[error("Embedding service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Rejected before any request was made
    #[error("Bad embedding request: {message}")]
    BadRequest { message: String },

    /// Non-2xx response from the service
    #[error("Embedding service returned {status}: {message}")]
    ServiceError { status: u16, message: String },

    /// 2xx response that does not satisfy the request
    #[error("Invalid embedding response: {message}")]
    InvalidResponse { message: String },

    /// Error when client configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Generic errors from other providers
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    pub fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    ///
    /// # Arguments
    /// * `message` - What is wrong with the configuration
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Classify a transport-level `reqwest` failure.
    ///
    /// Anything that happened before a status line was received counts as the service
    /// being unavailable; a body that could not be decoded is an invalid response.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::invalid_response(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::ServiceError {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            "connection failed".to_string()
        } else {
            err.to_string()
        };
        Self::ServiceUnavailable {
            message,
            source: Some(err),
        }
    }

    /// True for failures of the remote capability itself, as opposed to misuse.
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. } | Self::ServiceError { .. } | Self::InvalidResponse { .. }
        )
    }

    /// True when the service could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}
