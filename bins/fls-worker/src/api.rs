//! Control-plane client.
//!
//! Every HTTP outcome is classified here, at the boundary: status codes are
//! mapped onto [`WorkerError`] variants before anything else sees them.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fls_common::routes;
use fls_common::{ApiConfig, Arch, Submission};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

/// Error bodies are clipped before they end up in process logs.
const MAX_ERROR_BODY: usize = 512;

/// Operations the worker needs from the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_submissions(&self, arch: Arch) -> Result<Vec<Submission>>;

    /// Fails with [`WorkerError::AlreadyClaimed`] when another worker won.
    async fn claim(&self, submission: &Submission) -> Result<()>;

    async fn cancel(&self, submission: &Submission) -> Result<()>;

    /// Stream the submission archive to `dest` without buffering it.
    async fn download_tarball(&self, submission: &Submission, dest: &Path) -> Result<()>;

    async fn submit_result(&self, submission: &Submission, passed: bool, log_path: &Path) -> Result<()>;

    async fn heartbeat(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.secret))
            .map_err(|_| WorkerError::Unexpected("grading secret is not a valid header value".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.timeout)
            // streaming transfers have no overall deadline, only an idle one
            .read_timeout(config.timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            timeout: config.timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_empty(&self, path: &str, claiming: bool) -> Result<Response> {
        debug!("POST {}", path);
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response, claiming).await
    }
}

/// Single status mapping shared by every call.
/// 409 means "another worker holds it" only while claiming.
async fn check_status(response: Response, claiming: bool) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let path = response.url().path().to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WorkerError::Auth),
        StatusCode::NOT_FOUND => Err(WorkerError::NotFound(path)),
        StatusCode::CONFLICT if claiming => Err(WorkerError::AlreadyClaimed),
        StatusCode::CONFLICT => Err(WorkerError::Conflict(path)),
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(WorkerError::BadResponse {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn list_submissions(&self, arch: Arch) -> Result<Vec<Submission>> {
        let path = routes::submissions_path();
        debug!("GET {}?arch={}", path, arch);

        let response = self
            .client
            .get(self.url(&path))
            .query(&[("arch", arch.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check_status(response, false).await?;
        let status = response.status().as_u16();

        let raw: serde_json::Value = response.json().await?;
        if !raw.is_array() {
            return Err(WorkerError::BadResponse {
                status,
                body: format!("expected list, got {}", json_kind(&raw)),
            });
        }

        let submissions: Vec<Submission> =
            serde_json::from_value(raw).map_err(|e| WorkerError::BadResponse {
                status,
                body: format!("malformed submission record: {}", e),
            })?;

        Ok(submissions
            .into_iter()
            .filter(|s| {
                if s.arch != arch {
                    warn!(submission_id = s.id, arch = %s.arch, "ignoring submission for foreign architecture");
                }
                s.arch == arch
            })
            .collect())
    }

    async fn claim(&self, submission: &Submission) -> Result<()> {
        self.post_empty(&routes::claim_path(submission.id), true).await?;
        Ok(())
    }

    async fn cancel(&self, submission: &Submission) -> Result<()> {
        self.post_empty(&routes::cancel_path(submission.id), false).await?;
        Ok(())
    }

    async fn download_tarball(&self, submission: &Submission, dest: &Path) -> Result<()> {
        let path = routes::tarball_path(submission.id);
        debug!("GET {}", path);

        let response = self
            .client
            .get(self.url(&path))
            .send()
            .await?;
        let response = check_status(response, false).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| WorkerError::environment(format!("failed to create {}", dest.display()), e))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| WorkerError::environment("failed to write tarball", e))?;
        }
        file.flush()
            .await
            .map_err(|e| WorkerError::environment("failed to write tarball", e))?;

        Ok(())
    }

    async fn submit_result(&self, submission: &Submission, passed: bool, log_path: &Path) -> Result<()> {
        let path = routes::result_path(submission.id);
        debug!("POST {} passed={}", path, passed);

        let file = tokio::fs::File::open(log_path)
            .await
            .map_err(|e| WorkerError::environment(format!("failed to open {}", log_path.display()), e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| WorkerError::environment("failed to stat job log", e))?
            .len();

        let logs = Part::stream_with_length(reqwest::Body::wrap_stream(ReaderStream::new(file)), length)
            .file_name("logs.txt")
            .mime_str("text/plain")?;
        let form = Form::new()
            .text("passed", routes::passed_form_value(passed))
            .part("logs", logs);

        let response = self
            .client
            .post(self.url(&path))
            .multipart(form)
            .send()
            .await?;
        check_status(response, false).await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url(&routes::heartbeat_path()))
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response, false).await?;
        Ok(())
    }
}
