//! Remote module transport over HTTP.
//!
//! A remote module is a service exposing four JSON endpoints under its base
//! URL:
//!
//! | Endpoint | Request | Response |
//! |---|---|---|
//! | `POST /should_process` | `{file, document, workdir}` | `{"should_process": bool}` |
//! | `POST /process` | `{file, document, workdir}` | `ModuleOutput` |
//! | `POST /load` | `{}` | any (404 = not implemented) |
//! | `POST /unload` | `{}` | any (404 = not implemented) |
//!
//! Rate limiting (429), server errors and connection failures are retried
//! with exponential backoff; other client errors fail immediately.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use filedex_core::models::{Document, ModuleOutput};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::ModuleConfig;
use crate::module::Module;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Serialize)]
struct CallBody<'a> {
    file: Option<&'a Path>,
    document: &'a Document,
    workdir: &'a Path,
}

#[derive(Deserialize)]
struct ShouldProcessResponse {
    should_process: bool,
}

pub struct HttpModule {
    name: String,
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpModule {
    pub fn new(name: &str, base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_retries,
        })
    }

    pub fn from_config(config: &ModuleConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("module '{}' has kind 'http' but no url", config.name))?;
        let timeout = config
            .settings
            .get("timeout_secs")
            .and_then(|v| v.as_integer())
            .filter(|n| *n > 0)
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_retries = config
            .settings
            .get("max_retries")
            .and_then(|v| v.as_integer())
            .filter(|n| *n >= 0)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_MAX_RETRIES);
        Self::new(&config.name, url, Duration::from_secs(timeout), max_retries)
    }

    /// POST `body` to `endpoint`. `Ok(None)` means the service answered 404.
    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Option<reqwest::Response>> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(Some(response));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_err = Some(anyhow!(
                            "module '{}' {} error {}: {}",
                            self.name,
                            endpoint,
                            status,
                            body_text
                        ));
                        continue;
                    }
                    bail!(
                        "module '{}' {} error {}: {}",
                        self.name,
                        endpoint,
                        status,
                        body_text
                    );
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("module '{}' {} failed", self.name, endpoint)))
    }

    async fn lifecycle(&self, endpoint: &str) -> Result<()> {
        self.post(endpoint, &serde_json::json!({})).await?;
        Ok(())
    }
}

#[async_trait]
impl Module for HttpModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<()> {
        self.lifecycle("load").await
    }

    async fn unload(&self) -> Result<()> {
        self.lifecycle("unload").await
    }

    async fn should_process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        workdir: &Path,
    ) -> Result<bool> {
        let body = CallBody {
            file,
            document: doc,
            workdir,
        };
        let response = self
            .post("should_process", &body)
            .await?
            .ok_or_else(|| anyhow!("module '{}' has no should_process endpoint", self.name))?;
        let parsed: ShouldProcessResponse = response
            .json()
            .await
            .with_context(|| format!("module '{}' returned a malformed should_process", self.name))?;
        Ok(parsed.should_process)
    }

    async fn process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        workdir: &Path,
    ) -> Result<ModuleOutput> {
        let body = CallBody {
            file,
            document: doc,
            workdir,
        };
        let response = self
            .post("process", &body)
            .await?
            .ok_or_else(|| anyhow!("module '{}' has no process endpoint", self.name))?;
        response
            .json()
            .await
            .with_context(|| format!("module '{}' returned a malformed process output", self.name))
    }
}
