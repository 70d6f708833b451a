use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream rate limited (HTTP {status}, retry after {retry_after_secs:?}s)")]
    RateLimited {
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("binance API error (code {code}): {msg}")]
    BinanceApi { code: i64, msg: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Transient failures worth another attempt later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AppError::Transport("reset".into()).is_retryable());
        assert!(AppError::Timeout("klines".into()).is_retryable());
        assert!(AppError::RateLimited {
            status: 429,
            retry_after_secs: Some(10)
        }
        .is_retryable());
        assert!(!AppError::Storage("disk full".into()).is_retryable());
        assert!(!AppError::BinanceApi {
            code: -1121,
            msg: "Invalid symbol.".into()
        }
        .is_retryable());
    }

    #[test]
    fn rate_limit_is_detected() {
        let err = AppError::RateLimited {
            status: 418,
            retry_after_secs: None,
        };
        assert!(err.is_rate_limited());
        assert!(!AppError::Transport("x".into()).is_rate_limited());
    }
}
