use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{ContentSender, SendError, SendResponse};
use crate::model::DiaryContentRecord;

/// Read path for one diary's content records.
#[async_trait]
pub trait DiarySource: Send + Sync {
    async fn list_diary_content(&self, diary_id: &str) -> Result<Vec<DiaryContentRecord>>;
}

/// Write path for slot texts edited locally.
#[async_trait]
pub trait ContentEditor: Send + Sync {
    async fn update_content(
        &self,
        diary_id: &str,
        record_id: &str,
        content: &str,
        observations: Option<&str>,
    ) -> Result<()>;
}

/// HTTP client for the PlanIA API, which fronts the academic portal.
#[derive(Clone)]
pub struct PortalClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PortalClient {
    pub fn new(mut base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        // `Url::join` drops the last path segment unless it ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("plania-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(cfg.portal.base_url.trim()).context("invalid portal.base_url")?;
        Self::new(
            base_url,
            cfg.portal.token.clone(),
            Duration::from_secs(cfg.portal.timeout_seconds),
        )
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid portal endpoint {path}"))?;
        Ok(self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json"))
    }

    pub fn build_list_request(&self, diary_id: &str) -> Result<reqwest::Request> {
        self.request(Method::GET, &format!("v1/diaries/{diary_id}/contents"))?
            .build()
            .context("failed to build list request")
    }

    pub fn build_send_request(&self, diary_id: &str, content_id: &str) -> Result<reqwest::Request> {
        self.request(
            Method::POST,
            &format!("v1/diaries/{diary_id}/contents/{content_id}/send"),
        )?
        .build()
        .context("failed to build send request")
    }

    pub fn build_update_request(
        &self,
        diary_id: &str,
        record_id: &str,
        content: &str,
        observations: Option<&str>,
    ) -> Result<reqwest::Request> {
        let mut body = json!({ "content": content });
        if let Some(obs) = observations {
            body["observations"] = json!(obs);
        }
        self.request(
            Method::PATCH,
            &format!("v1/diaries/{diary_id}/contents/{record_id}"),
        )?
        .json(&body)
        .build()
        .context("failed to build update request")
    }
}

#[async_trait]
impl ContentEditor for PortalClient {
    /// Push a locally edited text upstream so the next send uses it.
    async fn update_content(
        &self,
        diary_id: &str,
        record_id: &str,
        content: &str,
        observations: Option<&str>,
    ) -> Result<()> {
        let request = self.build_update_request(diary_id, record_id, content, observations)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach PlanIA API")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("update of {record_id} failed {status}: {body}"));
        }
        info!(diary_id, record_id, "content updated upstream");
        Ok(())
    }
}

#[async_trait]
impl DiarySource for PortalClient {
    async fn list_diary_content(&self, diary_id: &str) -> Result<Vec<DiaryContentRecord>> {
        let request = self.build_list_request(diary_id)?;
        debug!(url = %request.url(), "listing diary content");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach PlanIA API")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("list diary {diary_id} failed {status}: {body}"));
        }
        res.json::<Vec<DiaryContentRecord>>()
            .await
            .context("invalid diary content JSON")
    }
}

#[async_trait]
impl ContentSender for PortalClient {
    async fn send_one(&self, diary_id: &str, content_id: &str) -> Result<SendResponse, SendError> {
        let request = self.build_send_request(diary_id, content_id)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach PlanIA API")?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            return Err(SendError::SessionExpired(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(content_id, %status, "send rejected");
            return Err(anyhow!("send failed {status}: {body}").into());
        }

        let payload = res
            .json::<SendResponse>()
            .await
            .context("invalid send response JSON")?;
        Ok(payload)
    }
}
