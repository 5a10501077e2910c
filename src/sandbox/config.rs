//! Sandbox client configuration
//!
//! Limits are forwarded to the remote executor on every request.

use std::time::Duration;

/// Lower bound on the per-request deadline
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base URL; requests go to `<base_url>/execute`
    pub base_url: String,
    /// Client-side deadline for one HTTP call
    pub request_timeout: Duration,
    /// Run stage time limit in milliseconds (default: 15000ms)
    pub run_timeout_ms: u32,
    /// Compile stage time limit in milliseconds (default: 20000ms)
    pub compile_timeout_ms: u32,
    /// Run stage memory limit in bytes (default: 512MB)
    pub run_memory_limit: i64,
    /// Compile stage memory limit in bytes (default: 1GB)
    pub compile_memory_limit: i64,
    /// Wait before the single retry on a 5xx response
    pub retry_backoff: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:2000/api/v2".to_string(),
            request_timeout: Duration::from_secs(45),
            run_timeout_ms: 15_000,
            compile_timeout_ms: 20_000,
            run_memory_limit: 512 * 1024 * 1024,
            compile_memory_limit: 1024 * 1024 * 1024,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl SandboxConfig {
    /// Clamp the deadline and strip a trailing slash from the base URL.
    pub fn normalized(mut self) -> Self {
        if self.request_timeout < MIN_REQUEST_TIMEOUT {
            self.request_timeout = MIN_REQUEST_TIMEOUT;
        }
        while self.base_url.ends_with('/') {
            self.base_url.pop();
        }
        self
    }

    pub fn execute_url(&self) -> String {
        format!("{}/execute", self.base_url)
    }
}
