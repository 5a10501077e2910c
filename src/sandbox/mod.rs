//! Sandbox module - remote code execution seam
//!
//! The executor is a remote service; this module only defines the contract:
//! - `SandboxClient`: one-shot `(language, version, code, stdin)` execution
//! - `ExecutionResult`: what came back, with memory already converted to KB
//! - `Fault`: how a result maps onto program-behaviour verdicts
//!
//! The sandbox module does NOT:
//! - Compare outputs or determine verdicts across test cases
//! - Retry beyond the single 5xx retry of the HTTP client

pub mod config;
pub mod piston;

use async_trait::async_trait;
use thiserror::Error;

pub use piston::PistonClient;

/// One execution request
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub language: String,
    pub version: String,
    pub code: String,
    pub stdin: String,
}

/// Result of one sandbox call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Interleaved stdout + stderr as reported by the executor
    pub output: String,
    pub exit_code: i32,
    pub cpu_ms: i64,
    pub memory_kb: i64,
    /// Signal that terminated the run stage, if any
    pub signal: Option<String>,
    /// Executor status code for the run stage (e.g. "TO" on timeout)
    pub status: Option<String>,
    /// Set when a separate compile stage failed
    pub compile_error: Option<String>,
}

/// Program misbehaviour derived from a sandbox result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Compilation(String),
    TimeLimit,
    MemoryLimit,
    Runtime(String),
}

impl ExecutionResult {
    /// Classify the run. `None` means the program exited cleanly and its
    /// output should be compared.
    pub fn fault(&self) -> Option<Fault> {
        if let Some(message) = &self.compile_error {
            return Some(Fault::Compilation(message.clone()));
        }
        match (self.signal.as_deref(), self.status.as_deref()) {
            (Some("SIGKILL"), _) | (_, Some("TO")) => return Some(Fault::TimeLimit),
            (Some("SIGABRT"), _) => return Some(Fault::MemoryLimit),
            _ => {}
        }
        if self.exit_code != 0 {
            return Some(Fault::Runtime(self.stderr.clone()));
        }
        None
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox transport error: {0}")]
    Transport(String),
    #[error("sandbox rejected request ({status}): {body}")]
    Client { status: u16, body: String },
    #[error("sandbox server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("sandbox response could not be decoded: {0}")]
    Decode(String),
    #[error("sandbox call cancelled")]
    Cancelled,
}

/// Remote executor contract
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutionResult, SandboxError>;
}
