//! Harness capability
//!
//! Per-language code generation lives outside the pipeline. The pipeline only
//! needs the stored stub and harness for a (problem, language) pair and a way
//! to splice user code into the harness.

use crate::core::{HarnessTemplate, Language};

/// Placeholder replaced by the user's code
pub const USER_CODE_MARKER: &str = "{USER_CODE}";

pub trait HarnessProvider: Send + Sync {
    /// Starter code shown to users.
    fn stub(&self, template: &HarnessTemplate, language: &Language) -> Option<String>;

    /// Wrapper that reads stdin, calls the user's function and prints the result.
    fn harness(&self, template: &HarnessTemplate, language: &Language) -> Option<String>;

    fn inject(&self, harness: &str, user_code: &str) -> String;

    /// Code actually sent to the sandbox. User code is used unchanged when
    /// there is no harness for the pair.
    fn effective_code(
        &self,
        template: Option<&HarnessTemplate>,
        language: &Language,
        user_code: &str,
    ) -> String {
        match template.and_then(|t| self.harness(t, language)) {
            Some(harness) => self.inject(&harness, user_code),
            None => user_code.to_string(),
        }
    }
}

/// Serves the templates stored alongside each problem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredHarness;

impl HarnessProvider for StoredHarness {
    fn stub(&self, template: &HarnessTemplate, _language: &Language) -> Option<String> {
        template.stub_code.clone().filter(|s| !s.trim().is_empty())
    }

    fn harness(&self, template: &HarnessTemplate, _language: &Language) -> Option<String> {
        template
            .harness_code
            .clone()
            .filter(|s| s.contains(USER_CODE_MARKER))
    }

    fn inject(&self, harness: &str, user_code: &str) -> String {
        harness.replacen(USER_CODE_MARKER, user_code, 1)
    }
}
