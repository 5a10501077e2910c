//! HTTP sandbox client
//!
//! Speaks the executor's JSON wire format:
//! `POST <base>/execute` with `{language, version, files:[{content}], stdin, args}`
//! and a response carrying `run` plus an optional `compile` stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::SandboxConfig;
use super::{ExecuteRequest, ExecutionResult, SandboxClient, SandboxError};

#[derive(Debug, Serialize)]
struct WireFile<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<WireFile<'a>>,
    stdin: &'a str,
    args: Vec<String>,
    compile_timeout: u32,
    run_timeout: u32,
    compile_memory_limit: i64,
    run_memory_limit: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireStage {
    stdout: String,
    stderr: String,
    output: String,
    code: Option<i32>,
    signal: Option<String>,
    status: Option<String>,
    message: Option<String>,
    cpu_time: Option<f64>,
    /// Bytes
    memory: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    run: WireStage,
    #[serde(default)]
    compile: Option<WireStage>,
}

impl WireStage {
    fn exit_code(&self) -> i32 {
        match (self.code, &self.signal) {
            (Some(code), _) => code,
            (None, Some(_)) => -1,
            (None, None) => 0,
        }
    }
}

impl From<WireResponse> for ExecutionResult {
    fn from(response: WireResponse) -> Self {
        let compile_error = response
            .compile
            .filter(|stage| stage.exit_code() != 0)
            .map(|stage| {
                if !stage.stderr.is_empty() {
                    stage.stderr
                } else if !stage.output.is_empty() {
                    stage.output
                } else {
                    stage.message.unwrap_or_else(|| "Compilation failed".to_string())
                }
            });

        let run = response.run;
        ExecutionResult {
            exit_code: run.exit_code(),
            cpu_ms: run.cpu_time.unwrap_or(0.0).round() as i64,
            memory_kb: run.memory.unwrap_or(0) / 1024,
            stdout: run.stdout,
            stderr: run.stderr,
            output: run.output,
            signal: run.signal,
            status: run.status,
            compile_error,
        }
    }
}

/// Sandbox client backed by the executor's HTTP API
pub struct PistonClient {
    http: reqwest::Client,
    config: SandboxConfig,
}

impl PistonClient {
    pub fn new(config: SandboxConfig) -> anyhow::Result<Self> {
        let config = config.normalized();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    async fn send_once(&self, body: &WireRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let response = self
            .http
            .post(self.config.execute_url())
            .json(body)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                SandboxError::Server {
                    status: status.as_u16(),
                    body: text,
                }
            } else {
                SandboxError::Client {
                    status: status.as_u16(),
                    body: text,
                }
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        Ok(wire.into())
    }
}

#[async_trait]
impl SandboxClient for PistonClient {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutionResult, SandboxError> {
        let body = WireRequest {
            language: &request.language,
            version: &request.version,
            files: vec![WireFile {
                content: &request.code,
            }],
            stdin: &request.stdin,
            args: Vec::new(),
            compile_timeout: self.config.compile_timeout_ms,
            run_timeout: self.config.run_timeout_ms,
            compile_memory_limit: self.config.compile_memory_limit,
            run_memory_limit: self.config.run_memory_limit,
        };

        match self.send_once(&body).await {
            Err(SandboxError::Server { status, body: text }) => {
                warn!(
                    "Sandbox returned {} for language={}: {}. Retrying once...",
                    status, request.language, text
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                self.send_once(&body).await
            }
            other => {
                if let Ok(result) = &other {
                    debug!(
                        "Sandbox run finished: exit_code={}, cpu_ms={}, memory_kb={}",
                        result.exit_code, result.cpu_ms, result.memory_kb
                    );
                }
                other
            }
        }
    }
}
