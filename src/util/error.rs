//! Error classification shared by job handlers and the generation pipeline.

use anyhow::Error;
use reqwest::StatusCode;
use sqlx::Error as SqlxError;

use crate::shapes::ExchangeError;

/// Coarse recovery class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// Worth retrying: network failure, timeout, 5xx, rate limit.
    Retryable,
    /// Not worth retrying: validation failure, missing resource.
    NonRetryable,
    /// Misconfiguration or auth failure; retrying cannot help.
    Fatal,
}

pub(crate) fn classify_error(error: &Error) -> ErrorKind {
    if let Some(exchange_err) = error.downcast_ref::<ExchangeError>() {
        return if exchange_err.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::NonRetryable
        };
    }

    if let Some(reqwest_err) = error.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_timeout() || reqwest_err.is_connect() {
            return ErrorKind::Retryable;
        }

        if let Some(status) = reqwest_err.status() {
            match status {
                StatusCode::TOO_MANY_REQUESTS => return ErrorKind::Retryable,
                s if s.is_server_error() => return ErrorKind::Retryable,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return ErrorKind::Fatal,
                StatusCode::BAD_REQUEST
                | StatusCode::NOT_FOUND
                | StatusCode::UNPROCESSABLE_ENTITY => return ErrorKind::NonRetryable,
                _ => {}
            }
        }
    }

    if let Some(sqlx_err) = error.downcast_ref::<SqlxError>() {
        match sqlx_err {
            SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
                return ErrorKind::Retryable;
            }
            SqlxError::RowNotFound => return ErrorKind::NonRetryable,
            SqlxError::Configuration(_) => return ErrorKind::Fatal,
            _ => {}
        }
    }

    ErrorKind::NonRetryable
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn plain_error_is_non_retryable() {
        let error = anyhow!("validation failed");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn exchange_rate_limit_is_retryable() {
        let error = Error::new(ExchangeError::RateLimit { retry_after: None });
        assert_eq!(classify_error(&error), ErrorKind::Retryable);
    }

    #[test]
    fn exchange_auth_is_non_retryable() {
        let error = Error::new(ExchangeError::Auth);
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }
}
