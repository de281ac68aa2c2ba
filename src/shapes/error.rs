use thiserror::Error;

/// Errors from the shapes service, split by recovery class. Retryable
/// variants re-throw to the queue while attempts remain; the rest fail the
/// exchange row immediately.
#[derive(Debug, Error)]
pub(crate) enum ExchangeError {
    #[error("shapes session rejected (expired or invalid credential)")]
    Auth,

    #[error("shapes resource not found")]
    NotFound,

    #[error("shapes rate limit hit{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimit { retry_after: Option<u64> },

    #[error("shapes server error (status {status})")]
    Server { status: u16 },

    #[error("shapes response mapping failed: {0}")]
    Mapping(String),

    #[error("shapes network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ExchangeError {
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::RateLimit { .. } | ExchangeError::Server { .. } => true,
            ExchangeError::Network(network_error) => {
                network_error.is_timeout() || network_error.is_connect()
            }
            ExchangeError::Auth | ExchangeError::NotFound | ExchangeError::Mapping(_) => false,
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, retry_after: Option<u64>) -> Self {
        match status.as_u16() {
            401 | 403 => ExchangeError::Auth,
            404 => ExchangeError::NotFound,
            429 => ExchangeError::RateLimit { retry_after },
            status_code @ 500..=599 => ExchangeError::Server {
                status: status_code,
            },
            status_code => ExchangeError::Mapping(format!("unexpected status {status_code}")),
        }
    }
}
