//! AI client error types

use std::fmt;

/// Errors that can occur when talking to an AI provider
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 401/403 - key invalid or lacking permissions
    Unauthorized { provider: String, status: u16 },
    /// 429 Rate Limited
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },
    /// Network or timeout error
    NetworkError { provider: String, message: String },
    /// Other HTTP errors
    HttpError {
        provider: String,
        status: u16,
        message: String,
    },
    /// The response body could not be understood
    InvalidResponse { provider: String, message: String },
    /// Provider not configured (no key in environment)
    NotConfigured { provider: String },
}

impl ApiError {
    /// Check if this is an authentication error (401 or 403)
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Check if this is a rate limiting error
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    /// Get the provider name for this error
    pub fn provider_name(&self) -> &str {
        match self {
            ApiError::Unauthorized { provider, .. }
            | ApiError::RateLimited { provider, .. }
            | ApiError::NetworkError { provider, .. }
            | ApiError::HttpError { provider, .. }
            | ApiError::InvalidResponse { provider, .. }
            | ApiError::NotConfigured { provider } => provider,
        }
    }

    pub fn unauthorized(provider: impl Into<String>, status: u16) -> Self {
        ApiError::Unauthorized {
            provider: provider.into(),
            status,
        }
    }

    pub fn rate_limited(provider: impl Into<String>, retry_after: Option<u64>) -> Self {
        ApiError::RateLimited {
            provider: provider.into(),
            retry_after_secs: retry_after,
        }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::NetworkError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn http(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        ApiError::HttpError {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    pub fn invalid_response(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::InvalidResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn not_configured(provider: impl Into<String>) -> Self {
        ApiError::NotConfigured {
            provider: provider.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized { provider, status } => {
                write!(f, "{provider}: Unauthorized ({status})")
            }
            ApiError::RateLimited {
                provider,
                retry_after_secs,
            } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "{provider}: Rate limited - retry after {secs}s")
                } else {
                    write!(f, "{provider}: Rate limited")
                }
            }
            ApiError::NetworkError { provider, message } => {
                write!(f, "{provider}: Network error - {message}")
            }
            ApiError::HttpError {
                provider,
                status,
                message,
            } => {
                write!(f, "{provider}: HTTP {status} - {message}")
            }
            ApiError::InvalidResponse { provider, message } => {
                write!(f, "{provider}: Invalid response - {message}")
            }
            ApiError::NotConfigured { provider } => {
                write!(f, "{provider}: Not configured (no API key)")
            }
        }
    }
}

impl std::error::Error for ApiError {}
