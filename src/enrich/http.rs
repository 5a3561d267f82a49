//! Generic JSON-over-HTTP enricher
//!
//! Sends one `GET` per row with the row's key value and the credential as
//! query parameters, then reads the classification label (and any extra
//! fields) out of the JSON response with JSON pointers.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use super::{Enricher, EnricherFactory, Enrichment};
use crate::config::{Credential, ProviderConfig};
use crate::error::{EnrichError, Error, Result};
use crate::types::Row;

/// Longest provider error body kept in a row's error text
const MAX_ERROR_BODY: usize = 200;

/// Enricher backed by an HTTP endpoint returning JSON
#[derive(Debug, Clone)]
pub struct HttpEnricher {
    client: reqwest::Client,
    endpoint: Url,
    key_column: String,
    query_param: String,
    credential_param: String,
    credential: Option<Credential>,
    label_pointer: String,
    success_labels: Vec<String>,
    field_pointers: BTreeMap<String, String>,
}

impl HttpEnricher {
    /// Create an enricher using the credential from the provider configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(config, config.credential.as_ref())
    }

    /// Create an enricher bound to a specific credential
    pub fn new(config: &ProviderConfig, credential: Option<&Credential>) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            Error::config(
                "provider.endpoint",
                format!("invalid URL {:?}: {e}", config.endpoint),
            )
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::config(&format!("provider.headers.{name}"), format!("invalid name: {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::config(&format!("provider.headers.{name}"), format!("invalid value: {e}"))
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("batch-enrich/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            key_column: config.key_column.clone(),
            query_param: config.query_param.clone(),
            credential_param: config.credential_param.clone(),
            credential: credential.cloned(),
            label_pointer: config.label_pointer.clone(),
            success_labels: config.success_labels.clone(),
            field_pointers: config.field_pointers.clone(),
        })
    }

    fn request_url(&self, key: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.query_param, key);
            if let Some(credential) = &self.credential {
                query.append_pair(&self.credential_param, &credential.secret);
            }
        }
        url
    }

    fn interpret(&self, payload: &Value) -> std::result::Result<Enrichment, EnrichError> {
        let label = match payload.pointer(&self.label_pointer) {
            Some(Value::Null) | None => {
                return Err(EnrichError::MalformedResponse(format!(
                    "no label at {:?}",
                    self.label_pointer
                )));
            }
            Some(value) => value_text(value),
        };

        let mut enrichment = if self.success_labels.iter().any(|l| *l == label) {
            Enrichment::success(label)
        } else {
            Enrichment::failure(label)
        };
        for (column, pointer) in &self.field_pointers {
            if let Some(value) = payload.pointer(pointer) {
                enrichment = enrichment.with_field(column, value_text(value));
            }
        }
        Ok(enrichment)
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, row: &Row) -> std::result::Result<Enrichment, EnrichError> {
        let key = row.get(&self.key_column).unwrap_or("").trim();
        let response = self.client.get(self.request_url(key)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnrichError::Provider {
                status: status.as_u16(),
                message: truncate(body.trim(), MAX_ERROR_BODY),
            });
        }

        let body = response.text().await?;
        let payload: Value = serde_json::from_str(&body)
            .map_err(|e| EnrichError::MalformedResponse(format!("response is not JSON: {e}")))?;
        self.interpret(&payload)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Builds one [`HttpEnricher`] per credential
#[derive(Debug, Clone)]
pub struct HttpEnricherFactory {
    config: ProviderConfig,
}

impl HttpEnricherFactory {
    /// Create a factory for the given provider
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl EnricherFactory for HttpEnricherFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Enricher>> {
        Ok(Arc::new(HttpEnricher::new(&self.config, Some(credential))?))
    }
}

/// Render a JSON value as a CSV cell
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
