//! Typed HTTP client for the rexd API.

use std::time::Duration;

use anyhow::{anyhow, Result};
use rex_common::protocol::{ExecStartRequest, ExecStartResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ExecLogsOptions {
    pub stream: Option<String>,
    /// Tail window in bytes; sent whenever non-negative.
    pub tail_bytes: Option<i64>,
    /// Tail window in lines; takes precedence server-side when positive.
    pub tail_lines: usize,
    pub since: Option<String>,
    pub until: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ExecClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("default reqwest client"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let resp = self.request(reqwest::Method::GET, "/health").send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("health status: {}", resp.status()));
        }
        Ok(resp.json().await?)
    }

    pub async fn exec_start(&self, req: &ExecStartRequest) -> Result<ExecStartResponse> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/exec")
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("exec start failed: {status}: {}", body.trim()));
        }
        Ok(resp.json().await?)
    }

    pub async fn exec_get(&self, exec_id: &str) -> Result<serde_json::Value> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/exec/{exec_id}"))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("exec get failed: {status}: {}", body.trim()));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn exec_cancel(&self, exec_id: &str) -> Result<serde_json::Value> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/v1/exec/{exec_id}/cancel"))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("exec cancel failed: {status}: {}", body.trim()));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn exec_logs(&self, exec_id: &str, opts: &ExecLogsOptions) -> Result<Vec<u8>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(stream) = &opts.stream {
            query.push(("stream", stream.clone()));
        }
        if let Some(tail) = opts.tail_bytes.filter(|&n| n >= 0) {
            query.push(("tail", tail.to_string()));
        }
        if opts.tail_lines > 0 {
            query.push(("tail_lines", opts.tail_lines.to_string()));
        }
        if let Some(since) = opts.since.as_deref().filter(|s| !s.is_empty()) {
            query.push(("since", since.to_string()));
        }
        if let Some(until) = opts.until.as_deref().filter(|s| !s.is_empty()) {
            query.push(("until", until.to_string()));
        }
        if let Some(format) = &opts.format {
            query.push(("format", format.clone()));
        }

        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/exec/{exec_id}/logs"))
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("exec logs failed: {status}: {}", body.trim()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ExecClient::new("http://127.0.0.1:7337/", None);
        assert_eq!(client.base_url(), "http://127.0.0.1:7337");
    }
}
