//! Gemini Batch API client over `reqwest`.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | upload | `POST /upload/v1beta/files` (resumable: start, then upload+finalize) |
//! | create | `POST /v1beta/models/{model}:batchGenerateContent` |
//! | get | `GET /v1beta/{batches/id}` |
//! | cancel | `POST /v1beta/{batches/id}:cancel` |
//! | download | `GET /download/v1beta/{files/id}:download?alt=media` |

use super::{BatchService, JobInput, JobOutput, RemoteJob, RemoteState};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ServiceError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const SERVICE: &str = "gemini-batch";

pub struct GeminiBatchService {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for GeminiBatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiBatchService")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiBatchService {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let key = config
            .service_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PipelineError::ProviderNotConfigured {
                provider: SERVICE.to_string(),
                hint: "Set INVOICE_PIPELINE_SERVICE_API_KEY or GEMINI_API_KEY.".to_string(),
            })?;
        Self::new(
            &config.service_base_url,
            key,
            &config.batch_model,
            config.api_timeout_secs,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        check_status(response).await
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, ServiceError> {
        self.send(request)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                service: SERVICE.to_string(),
                secs: self.timeout_secs,
            }
        } else if e.is_connect() || e.is_request() || e.is_body() {
            ServiceError::Transient(e.to_string())
        } else {
            ServiceError::Api(e.to_string())
        }
    }
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let detail = format!("HTTP {status}: {}", body.chars().take(500).collect::<String>());
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited {
            service: SERVICE.to_string(),
            retry_after_secs: retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth {
            service: SERVICE.to_string(),
            detail,
        },
        StatusCode::REQUEST_TIMEOUT => ServiceError::Transient(detail),
        s if s.is_server_error() => ServiceError::Transient(detail),
        _ => ServiceError::Api(detail),
    })
}

/// Parse a batch operation or batch resource into a [`RemoteJob`].
pub fn parse_job(value: &Value) -> Result<RemoteJob, ServiceError> {
    let body = value.get("metadata").unwrap_or(value);
    let id = value
        .get("name")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::Malformed("job without a name".to_string()))?
        .to_string();
    let raw_state = body
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("BATCH_STATE_PENDING");
    let state = RemoteState::parse(raw_state)
        .ok_or_else(|| ServiceError::Malformed(format!("unknown job state '{raw_state}'")))?;

    let output = body
        .get("output")
        .or_else(|| value.get("response"))
        .and_then(parse_output);
    let error = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RemoteJob {
        id,
        state,
        output,
        error,
    })
}

fn parse_output(output: &Value) -> Option<JobOutput> {
    if let Some(file) = output.get("responsesFile").and_then(Value::as_str) {
        return Some(JobOutput::File {
            file_name: file.to_string(),
        });
    }
    let inlined = output.get("inlinedResponses")?;
    let responses = inlined
        .get("inlinedResponses")
        .unwrap_or(inlined)
        .as_array()?
        .clone();
    Some(JobOutput::Inline { responses })
}

#[async_trait]
impl BatchService for GeminiBatchService {
    async fn upload_file(
        &self,
        display_name: &str,
        content: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let start = self
            .send(
                self.client
                    .post(self.url("upload/v1beta/files"))
                    .header("X-Goog-Upload-Protocol", "resumable")
                    .header("X-Goog-Upload-Command", "start")
                    .header("X-Goog-Upload-Header-Content-Length", content.len())
                    .header("X-Goog-Upload-Header-Content-Type", "application/jsonl")
                    .json(&json!({ "file": { "display_name": display_name } })),
            )
            .await?;
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Malformed("upload start without upload URL".into()))?
            .to_string();

        let size = content.len();
        let finished = self
            .send_json(
                self.client
                    .post(upload_url)
                    .header("X-Goog-Upload-Offset", 0)
                    .header("X-Goog-Upload-Command", "upload, finalize")
                    .body(content),
            )
            .await?;
        let name = finished
            .pointer("/file/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Malformed("upload response without file name".into()))?;
        info!(file = name, bytes = size, "Uploaded request file");
        Ok(name.to_string())
    }

    async fn create_job(
        &self,
        display_name: &str,
        input: JobInput,
    ) -> Result<RemoteJob, ServiceError> {
        let input_config = match input {
            JobInput::File { file_name } => json!({ "file_name": file_name }),
            JobInput::Inline { requests } => json!({ "requests": { "requests": requests } }),
        };
        let body = json!({
            "batch": {
                "display_name": display_name,
                "input_config": input_config,
            }
        });
        let value = self
            .send_json(
                self.client
                    .post(self.url(&format!(
                        "v1beta/models/{}:batchGenerateContent",
                        self.model
                    )))
                    .json(&body),
            )
            .await?;
        let job = parse_job(&value)?;
        info!(job = %job.id, state = ?job.state, "Created remote batch job");
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<RemoteJob, ServiceError> {
        let value = self
            .send_json(self.client.get(self.url(&format!("v1beta/{id}"))))
            .await?;
        let job = parse_job(&value)?;
        debug!(job = id, state = ?job.state, "Polled remote job");
        Ok(job)
    }

    async fn cancel_job(&self, id: &str) -> Result<(), ServiceError> {
        self.send(self.client.post(self.url(&format!("v1beta/{id}:cancel"))))
            .await?;
        info!(job = id, "Requested remote cancellation");
        Ok(())
    }

    async fn download_file(&self, file_name: &str, dest: &Path) -> Result<u64, ServiceError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("download/v1beta/{file_name}:download")))
                    .query(&[("alt", "media")]),
            )
            .await?;
        let io_err = |e: std::io::Error| ServiceError::Transient(format!("{}: {e}", dest.display()));
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(e))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        debug!(file = file_name, dest = %dest.display(), bytes = written, "Downloaded output");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_operation() {
        let job = parse_job(&json!({
            "name": "batches/abc123",
            "metadata": {
                "@type": "type.googleapis.com/google.ai.generativelanguage.v1main.GenerateContentBatch",
                "name": "batches/abc123",
                "state": "BATCH_STATE_PENDING"
            }
        }))
        .unwrap();
        assert_eq!(job.id, "batches/abc123");
        assert_eq!(job.state, RemoteState::Pending);
        assert!(job.output.is_none());
    }

    #[test]
    fn parses_file_and_inline_outputs() {
        let job = parse_job(&json!({
            "name": "batches/x",
            "metadata": {
                "state": "BATCH_STATE_SUCCEEDED",
                "output": { "responsesFile": "files/out-1" }
            },
            "done": true
        }))
        .unwrap();
        assert_eq!(
            job.output,
            Some(JobOutput::File {
                file_name: "files/out-1".into()
            })
        );

        let job = parse_job(&json!({
            "name": "batches/y",
            "metadata": { "state": "JOB_STATE_SUCCEEDED" },
            "response": {
                "inlinedResponses": { "inlinedResponses": [ { "metadata": { "key": "a" } } ] }
            }
        }))
        .unwrap();
        match job.output {
            Some(JobOutput::Inline { responses }) => assert_eq!(responses.len(), 1),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_state() {
        let err = parse_job(&json!({ "name": "batches/z", "state": "WEIRD" })).unwrap_err();
        assert!(matches!(err, ServiceError::Malformed(_)));
    }

    #[test]
    fn from_config_requires_key() {
        let config = PipelineConfig::default();
        if config.service_api_key.is_none() {
            assert!(matches!(
                GeminiBatchService::from_config(&config),
                Err(PipelineError::ProviderNotConfigured { .. })
            ));
        }
    }
}
