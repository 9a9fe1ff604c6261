//! Translation collaborator seam.
//!
//! The engine treats translation as an opaque `translate(text, lang,
//! context) -> text` call. English never crosses the seam, and any failure
//! falls back to the original text at the call site - a user receiving an
//! untranslated alert beats a user receiving nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Abstract translation collaborator.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target_lang`. `context` hints at the domain
    /// (e.g. "Emergency disaster alert") for better output.
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        context: &str,
    ) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    target_lang: &'a str,
    context: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translated: String,
}

/// HTTP-backed translator posting to an external translation service.
#[derive(Clone)]
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranslator {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        context: &str,
    ) -> anyhow::Result<String> {
        let request = TranslateRequest {
            text,
            target_lang,
            context,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let data = response.json::<TranslateResponse>().await?;
        Ok(data.translated)
    }
}

/// Pass-through translator for deployments without a translation service.
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(
        &self,
        text: &str,
        _target_lang: &str,
        _context: &str,
    ) -> anyhow::Result<String> {
        Ok(text.to_string())
    }
}
