//! Test-case fan-out and verdict aggregation
//!
//! - `run_test_cases`: runs every test case through the sandbox with bounded
//!   parallelism; results come back in test-case order
//! - `aggregate`: folds those results into the terminal outcome
//!
//! Fan-out never short-circuits, so `passed_count` is exact. The first failing
//! test case in order decides the status and error message.

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::utils::{outputs_match, truncate_utf8, MAX_STORED_OUTPUT};
use crate::core::{Language, SubmissionOutcome, SubmissionStatus, TestCase, TestCaseResult, TestStatus};
use crate::sandbox::{ExecuteRequest, ExecutionResult, Fault, SandboxClient, SandboxError};

pub const EXECUTION_SYSTEM_ERROR: &str = "Execution system error";

pub type CaseRun = Result<ExecutionResult, SandboxError>;

/// Run `code` against every test case, at most `max_parallel` sandbox calls at a time.
///
/// The returned vector is indexed like `cases`. Calls still outstanding when
/// `cancel` fires resolve to `SandboxError::Cancelled`.
pub async fn run_test_cases(
    sandbox: &dyn SandboxClient,
    language: &Language,
    code: &str,
    cases: &[TestCase],
    max_parallel: usize,
    cancel: &CancellationToken,
) -> Vec<CaseRun> {
    let slots = Semaphore::new(max_parallel.max(1));

    let mut pending: FuturesUnordered<_> = cases
        .iter()
        .enumerate()
        .map(|(idx, case)| {
            let slots = &slots;
            let request = ExecuteRequest {
                language: language.slug.clone(),
                version: language.runtime_version.clone(),
                code: code.to_string(),
                stdin: case.input.clone(),
            };
            async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (idx, Err(SandboxError::Cancelled)),
                    permit = slots.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (idx, Err(SandboxError::Cancelled)),
                    },
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(SandboxError::Cancelled),
                    result = sandbox.execute(&request) => result,
                };
                (idx, result)
            }
        })
        .collect();

    let mut runs: Vec<Option<CaseRun>> = cases.iter().map(|_| None).collect();
    while let Some((idx, result)) = pending.next().await {
        runs[idx] = Some(result);
    }

    runs.into_iter()
        .map(|run| run.unwrap_or(Err(SandboxError::Cancelled)))
        .collect()
}

fn wrong_answer_message(input: &str, expected: &str, actual: &str) -> String {
    format!(
        "Failed on input: {}\nExpected: {}\nActual: {}",
        input,
        expected.trim_end(),
        actual.trim_end()
    )
}

/// Fold per-case runs (indexed like `cases`) into the terminal outcome.
pub fn aggregate(cases: &[TestCase], runs: Vec<CaseRun>) -> SubmissionOutcome {
    let mut first_failure: Option<(SubmissionStatus, String)> = None;
    let mut passed_count = 0;
    let mut runtime_ms: Option<i64> = None;
    let mut memory_kb: Option<i64> = None;
    let mut test_results = Vec::with_capacity(cases.len());

    for (case, run) in cases.iter().zip(runs) {
        let (status, actual, case_runtime, case_memory, failure) = match run {
            Err(_) => (
                TestStatus::Failed,
                String::new(),
                None,
                None,
                Some((
                    SubmissionStatus::InternalError,
                    EXECUTION_SYSTEM_ERROR.to_string(),
                )),
            ),
            Ok(result) => {
                runtime_ms = Some(runtime_ms.unwrap_or(0).max(result.cpu_ms));
                memory_kb = Some(memory_kb.unwrap_or(0).max(result.memory_kb));

                let failure = match result.fault() {
                    Some(Fault::Compilation(message)) => Some((
                        SubmissionStatus::CompilationError,
                        truncate_utf8(&message, MAX_STORED_OUTPUT),
                    )),
                    Some(Fault::TimeLimit) => Some((
                        SubmissionStatus::TimeLimitExceeded,
                        "Time limit exceeded".to_string(),
                    )),
                    Some(Fault::MemoryLimit) => Some((
                        SubmissionStatus::MemoryLimitExceeded,
                        "Memory limit exceeded".to_string(),
                    )),
                    Some(Fault::Runtime(stderr)) => Some((
                        SubmissionStatus::RuntimeError,
                        truncate_utf8(&stderr, MAX_STORED_OUTPUT),
                    )),
                    None if outputs_match(&result.stdout, &case.expected_output) => None,
                    None => Some((
                        SubmissionStatus::WrongAnswer,
                        wrong_answer_message(&case.input, &case.expected_output, &result.stdout),
                    )),
                };
                let status = if failure.is_none() {
                    TestStatus::Passed
                } else {
                    TestStatus::Failed
                };
                (
                    status,
                    truncate_utf8(&result.stdout, MAX_STORED_OUTPUT),
                    Some(result.cpu_ms),
                    Some(result.memory_kb),
                    failure,
                )
            }
        };

        match failure {
            None => passed_count += 1,
            Some(failure) => {
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }

        test_results.push(TestCaseResult {
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            actual_output: actual,
            status,
            is_sample: case.is_sample,
            runtime_ms: case_runtime,
            memory_kb: case_memory,
        });
    }

    let (status, error_message) = match first_failure {
        Some((status, message)) => (status, Some(message)),
        None => (SubmissionStatus::Accepted, None),
    };

    SubmissionOutcome {
        status,
        error_message,
        runtime_ms,
        memory_kb,
        passed_count,
        total_count: cases.len() as i32,
        test_results,
    }
}
