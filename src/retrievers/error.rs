//! Failure taxonomy shared by every retriever.

use std::error::Error as StdError;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

const MAX_RESPONSE_TEXT_CHARS: usize = 500;

/// Errors raised by one retriever operation.
///
/// Each variant is fatal to the single search, listing or resolve call that
/// produced it and is translated into a lifecycle event by the orchestrator.
#[derive(Debug, Error)]
pub enum RetrieverError {
    /// Caller-supplied arguments are unusable.
    #[error("{message}")]
    Input {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Transport-level failure such as a timeout, DNS failure or refused connection.
    #[error("{message}")]
    Network {
        message: String,
        url: Option<String>,
        #[source]
        source: Option<BoxError>,
    },
    /// The remote service answered with an error status.
    #[error("{message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        url: Option<String>,
        response_text: Option<String>,
        #[source]
        source: Option<BoxError>,
    },
    /// The response arrived but could not be interpreted.
    #[error("{message}")]
    Data {
        message: String,
        url: Option<String>,
        #[source]
        source: Option<BoxError>,
    },
    /// Any other retriever-internal failure.
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl RetrieverError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            source: None,
        }
    }

    pub fn network(message: impl Into<String>, url: &str, source: Option<BoxError>) -> Self {
        Self::Network {
            message: message.into(),
            url: Some(url.to_string()),
            source,
        }
    }

    pub fn data(message: impl Into<String>, url: Option<&str>) -> Self {
        Self::Data {
            message: message.into(),
            url: url.map(str::to_string),
            source: None,
        }
    }

    pub fn data_with_source(
        message: impl Into<String>,
        url: Option<&str>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Data {
            message: message.into(),
            url: url.map(str::to_string),
            source: Some(source.into()),
        }
    }

    pub fn other(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Other {
            message: message.into(),
            source,
        }
    }

    /// Builds an error from a failed `ureq` call.
    ///
    /// Status failures become [`RetrieverError::Api`] with the status code,
    /// final URL and a truncated body when they can be read. Transport
    /// failures become [`RetrieverError::Network`].
    pub fn from_http_error(error: ureq::Error, custom_message: Option<String>) -> Self {
        match error {
            ureq::Error::Status(code, response) => {
                let url = response.get_url().to_string();
                let response_text = response
                    .into_string()
                    .ok()
                    .map(|body| truncate_chars(&body, MAX_RESPONSE_TEXT_CHARS));
                let message = custom_message
                    .unwrap_or_else(|| format!("API request to {url} failed with status {code}"));
                Self::Api {
                    message,
                    status_code: Some(code),
                    url: Some(url),
                    response_text,
                    source: None,
                }
            }
            ureq::Error::Transport(transport) => {
                let url = transport.url().map(|url| url.to_string());
                let message = custom_message.unwrap_or_else(|| {
                    format!(
                        "Request to {} failed: {}",
                        url.as_deref().unwrap_or("unknown URL"),
                        transport
                    )
                });
                Self::Network {
                    message,
                    url,
                    source: Some(Box::new(transport)),
                }
            }
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Short category label used in log lines.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Network { .. } => "network",
            Self::Api { .. } => "api",
            Self::Data { .. } => "data",
            Self::Other { .. } => "error",
        }
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{truncate_chars, RetrieverError};

    #[test]
    fn test_constructors_set_kind_and_url() {
        let error = RetrieverError::network("timed out", "https://a.example", None);
        assert_eq!(error.kind_label(), "network");
        assert_eq!(error.to_string(), "timed out");
        match error {
            RetrieverError::Network { url, .. } => {
                assert_eq!(url.as_deref(), Some("https://a.example"))
            }
            other => panic!("unexpected variant {other:?}"),
        }

        let api = RetrieverError::Api {
            message: "forbidden".to_string(),
            status_code: Some(403),
            url: None,
            response_text: None,
            source: None,
        };
        assert_eq!(api.status_code(), Some(403));
        assert_eq!(RetrieverError::input("empty").status_code(), None);
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 50), "short");
    }
}
