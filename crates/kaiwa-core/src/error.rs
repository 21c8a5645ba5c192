use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification carried on wire frames and metric rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Protocol,
    BusyDropped,
    ProviderTransient,
    ProviderFatal,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Protocol => "protocol",
            Self::BusyDropped => "busy_dropped",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderFatal => "provider_fatal",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session busy, input dropped")]
    BusyDropped,

    #[error("provider {provider} failed: {message}")]
    Provider {
        provider: String,
        message: String,
        retriable: bool,
    },

    #[error("{phase} timed out")]
    Timeout { phase: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("module {kind}/{code} not available")]
    ModuleUnavailable { kind: String, code: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn provider_transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retriable: true,
        }
    }

    pub fn provider_fatal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retriable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::BusyDropped => ErrorKind::BusyDropped,
            Self::Provider { retriable: true, .. } => ErrorKind::ProviderTransient,
            Self::Provider { retriable: false, .. } => ErrorKind::ProviderFatal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_) | Self::ModuleUnavailable { .. } => ErrorKind::ProviderFatal,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may retry the failed call within the turn.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Provider { retriable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors_are_retriable() {
        let err = Error::provider_transient("bailian", "connection reset");
        assert!(err.is_retriable());
        assert_eq!(err.kind(), ErrorKind::ProviderTransient);

        let err = Error::provider_fatal("bailian", "invalid api key");
        assert!(!err.is_retriable());
        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
    }

    #[test]
    fn timeouts_classify_separately_from_fatal() {
        let err = Error::Timeout { phase: "llm_first_token" };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_retriable());
    }
}
