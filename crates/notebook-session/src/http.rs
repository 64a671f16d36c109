//! Jupyter server REST client.
//!
//! Implements [`KernelService`] and [`ContentStore`] over the server's
//! `/api/kernels` and `/api/contents` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::api::{ApiError, ContentStore, KernelService};
use crate::protocol::{
    ContentEntry, ContentModel, ContentType, ExecuteRequest, KernelModel, SaveNotebookRequest,
    ServerStatus, StartKernelRequest,
};
use crate::settings::ClientSettings;

/// Async client for one Jupyter server.
#[derive(Clone)]
pub struct JupyterClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl JupyterClient {
    /// Create a client with no request timeout.
    pub fn new(api_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(api_url, token, None)
    }

    pub fn with_timeout(
        api_url: &str,
        token: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ApiError> {
        let base =
            Url::parse(api_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", api_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(api_url.to_string()));
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(format!("notebook-session/{}", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ApiError> {
        Self::with_timeout(
            &settings.api_url,
            settings.token.clone(),
            settings.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Append percent-encoded path segments to the API base.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn kernel_url(&self, kernel_id: &str, action: Option<&str>) -> Result<Url, ApiError> {
        self.endpoint(["kernels", kernel_id].into_iter().chain(action))
    }

    fn content_url(&self, path: &str) -> Result<Url, ApiError> {
        self.endpoint(std::iter::once("contents").chain(path.split('/').filter(|s| !s.is_empty())))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("[http] {} {}", method, url);
        let builder = self.http.request(method, url);
        if self.token.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION, format!("token {}", self.token))
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let path = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(path));
        }
        Err(ApiError::Http {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(builder).await?;
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Parse(e.to_string())
            }
        })
    }

    /// Like [`Self::json`], but an empty body reads as `null`.
    async fn loose_json(&self, builder: RequestBuilder) -> Result<Value, ApiError> {
        let response = self.send(builder).await?;
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

/// Jupyter error bodies look like `{"message": "...", "reason": ...}`.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl KernelService for JupyterClient {
    async fn status(&self) -> Result<ServerStatus, ApiError> {
        let url = self.endpoint(["status"])?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn list_kernels(&self) -> Result<Vec<KernelModel>, ApiError> {
        let url = self.endpoint(["kernels"])?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn get_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError> {
        let url = self.kernel_url(kernel_id, None)?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelModel, ApiError> {
        let url = self.endpoint(["kernels"])?;
        let body = StartKernelRequest {
            name: kernel_name.to_string(),
            path: "/".to_string(),
        };
        self.json(self.request(Method::POST, url).json(&body)).await
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ApiError> {
        let url = self.kernel_url(kernel_id, None)?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError> {
        let url = self.kernel_url(kernel_id, Some("restart"))?;
        self.json(self.request(Method::POST, url)).await
    }

    async fn execute(&self, kernel_id: &str, request: &ExecuteRequest) -> Result<Value, ApiError> {
        let url = self.kernel_url(kernel_id, Some("execute"))?;
        self.loose_json(self.request(Method::POST, url).json(request))
            .await
    }
}

#[async_trait]
impl ContentStore for JupyterClient {
    async fn list(&self, dir: &str) -> Result<Vec<ContentEntry>, ApiError> {
        let url = self.content_url(dir)?;
        let model: ContentModel = self.json(self.request(Method::GET, url)).await?;
        if model.entry.content_type != ContentType::Directory {
            return Err(ApiError::Parse(format!("{} is not a directory", dir)));
        }
        serde_json::from_value(model.content).map_err(|e| ApiError::Parse(e.to_string()))
    }

    async fn read(&self, path: &str) -> Result<ContentModel, ApiError> {
        let url = self.content_url(path)?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn stat(&self, path: &str) -> Result<ContentEntry, ApiError> {
        let mut url = self.content_url(path)?;
        url.query_pairs_mut().append_pair("content", "0");
        self.json(self.request(Method::GET, url)).await
    }

    async fn write(&self, path: &str, content: &Value) -> Result<ContentEntry, ApiError> {
        let url = self.content_url(path)?;
        let body = SaveNotebookRequest::new(content);
        self.json(self.request(Method::PUT, url).json(&body)).await
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let url = self.content_url(path)?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }
}
