//! Error types shared by every layer of the autoscaler.

/// Error returned by autoscaler operations.
///
/// The variants mirror the failure domains of an iteration: talking to the
/// orchestrator, internal model consistency, the cloud provider API, races
/// on shared registries, and operator misconfiguration. Only
/// `Configuration` is fatal; everything else ends the current iteration and
/// the next scheduled one starts fresh.
#[derive(thiserror::Error, Debug)]
pub enum AutoscalerError {
    #[error("orchestrator API call failed: {message}")]
    ApiCall { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("cloud provider call failed: {message}")]
    CloudProvider { message: String },

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl AutoscalerError {
    pub fn api_call(message: impl Into<String>) -> Self {
        Self::ApiCall {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn cloud_provider(message: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Fatal errors indicate the operator misconfigured the deployment;
    /// retrying is pointless and the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Prefix the message, preserving the error kind.
    pub fn add_prefix(self, prefix: &str) -> Self {
        let rewrap = |message: String| format!("{prefix}: {message}");
        match self {
            Self::ApiCall { message } => Self::ApiCall {
                message: rewrap(message),
            },
            Self::Internal { message } => Self::Internal {
                message: rewrap(message),
            },
            Self::CloudProvider { message } => Self::CloudProvider {
                message: rewrap(message),
            },
            Self::Transient { message } => Self::Transient {
                message: rewrap(message),
            },
            Self::Configuration { message } => Self::Configuration {
                message: rewrap(message),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AutoscalerError>;
