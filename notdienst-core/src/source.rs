use crate::{
    Config, PharmacyRecord,
    source::{feed::FeedSource, portal::PortalSource},
};
use async_trait::async_trait;
use fantoccini::error::{CmdError, NewSessionError};
use reqwest::{Client, StatusCode};
use std::{convert::TryFrom, fmt::Debug, path::PathBuf, time::Duration};
use thiserror::Error;

pub mod feed;
pub mod portal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    Feed,
    Portal,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Feed => "feed",
            SourceId::Portal => "portal",
        }
    }

    pub const fn all() -> &'static [SourceId] {
        &[SourceId::Feed, SourceId::Portal]
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SourceId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "feed" | "api" | "xml" => Ok(SourceId::Feed),
            "portal" | "web" => Ok(SourceId::Portal),
            _ => {
                let supported: Vec<&str> = SourceId::all().iter().map(SourceId::as_str).collect();
                Err(anyhow::anyhow!(
                    "Unknown source '{value}'. Supported sources: {}.",
                    supported.join(", ")
                ))
            }
        }
    }
}

/// Why an acquisition produced nothing usable.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Timed out after {}s waiting for {url}", .after.as_secs())]
    Timeout { url: String, after: Duration },

    #[error("Request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("Invalid URL '{0}'")]
    Url(String),

    #[error("Could not start a browser session at {url}")]
    WebDriver {
        url: String,
        #[source]
        source: NewSessionError,
    },

    #[error("Browser failed while loading {url}")]
    Browser {
        url: String,
        #[source]
        source: CmdError,
    },

    #[error("Failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed feed XML at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("Invalid CSS selector '{0}'")]
    Selector(String),

    #[error("Entry {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Entry {index} has invalid {field}: '{value}'")]
    InvalidField { index: usize, field: &'static str, value: String },
}

impl SourceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Timeout { .. })
    }
}

/// A supplier of raw pharmacy entries. Order of the result is irrelevant;
/// ranking happens downstream.
#[async_trait]
pub trait PharmacySource: Send + Sync + Debug {
    fn id(&self) -> SourceId;

    async fn fetch(&self) -> Result<Vec<PharmacyRecord>, SourceError>;
}

/// Construct a source from config and explicit SourceId.
pub fn source_from_config(
    id: SourceId,
    config: &Config,
) -> anyhow::Result<Box<dyn PharmacySource>> {
    let boxed: Box<dyn PharmacySource> = match id {
        SourceId::Feed => Box::new(FeedSource::from_config(config)?),
        SourceId::Portal => Box::new(PortalSource::from_config(config)?),
    };

    Ok(boxed)
}

/// Construct the source named by the `source` field.
pub fn default_source_from_config(config: &Config) -> anyhow::Result<Box<dyn PharmacySource>> {
    let id = config.source_id()?;
    source_from_config(id, config)
}

/// GET `url` and read the body, bounded by `timeout` for the whole exchange.
pub(crate) async fn get_text(
    http: &Client,
    url: &str,
    query: &[(&str, &str)],
    timeout: Duration,
) -> Result<(StatusCode, String), SourceError> {
    let exchange = async {
        let res = http.get(url).query(query).send().await?;
        let status = res.status();
        let body = res.text().await?;
        Ok::<_, reqwest::Error>((status, body))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(source)) => Err(SourceError::Http { url: url.to_string(), source }),
        Err(_) => Err(SourceError::Timeout { url: url.to_string(), after: timeout }),
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
