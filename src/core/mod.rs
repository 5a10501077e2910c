pub mod models;
pub mod utils;
pub mod verdict;

pub use models::*;
pub use verdict::{Difficulty, ProgressStatus, SubmissionStatus, TestStatus};
