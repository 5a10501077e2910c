use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a submission.
///
/// Transitions are monotone: `Pending -> Processing -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    InternalError,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::WrongAnswer => "wrong_answer",
            SubmissionStatus::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            SubmissionStatus::RuntimeError => "runtime_error",
            SubmissionStatus::CompilationError => "compilation_error",
            SubmissionStatus::InternalError => "internal_error",
        }
    }

    /// Terminal statuses are never left once reached.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending | SubmissionStatus::Processing)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => SubmissionStatus::Pending,
            "processing" => SubmissionStatus::Processing,
            "accepted" => SubmissionStatus::Accepted,
            "wrong_answer" => SubmissionStatus::WrongAnswer,
            "time_limit_exceeded" => SubmissionStatus::TimeLimitExceeded,
            "memory_limit_exceeded" => SubmissionStatus::MemoryLimitExceeded,
            "runtime_error" => SubmissionStatus::RuntimeError,
            "compilation_error" => SubmissionStatus::CompilationError,
            "internal_error" => SubmissionStatus::InternalError,
            other => anyhow::bail!("Unknown submission status: {}", other),
        };
        Ok(status)
    }
}

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Per-(user, problem) progression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Unsolved,
    Attempted,
    Solved,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Unsolved => "unsolved",
            ProgressStatus::Attempted => "attempted",
            ProgressStatus::Solved => "solved",
        }
    }
}

impl FromStr for ProgressStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsolved" => Ok(ProgressStatus::Unsolved),
            "attempted" => Ok(ProgressStatus::Attempted),
            "solved" => Ok(ProgressStatus::Solved),
            other => anyhow::bail!("Unknown progress status: {}", other),
        }
    }
}

/// Problem difficulty tier used by difficulty-count achievements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => anyhow::bail!("Unknown difficulty: {}", other),
        }
    }
}
