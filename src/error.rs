// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("{0} is not available: no API key configured")]
    ProviderUnavailable(String),

    #[error("{provider} request failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a transport or protocol failure as a provider error.
    pub(crate) fn provider(provider: impl Into<String>, source: Error) -> Self {
        match source {
            // Already classified; don't nest.
            e @ (Error::Provider { .. } | Error::ProviderUnavailable(_)) => e,
            other => Error::Provider {
                provider: provider.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns a concise message suitable for display in the conversation view.
    /// API error bodies that are JSON are pretty-printed.
    pub(crate) fn tui_message(&self) -> String {
        match self {
            Error::Api { status, message } => {
                let body = match serde_json::from_str::<serde_json::Value>(message) {
                    Ok(json) => serde_json::to_string_pretty(&json).unwrap_or_else(|_| message.clone()),
                    Err(_) => message.clone(),
                };
                format!("{status}: {body}")
            }
            Error::Provider { provider, source } => {
                format!("{provider}: {}", source.tui_message())
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn is_provider_error(&self) -> bool {
        matches!(self, Error::Provider { .. })
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
