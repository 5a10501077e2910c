//! Achievement pipeline
//!
//! - `catalog`: static rule set embedded from `files/achievements.toml`
//! - `evaluator`: consumes achievement jobs and unlocks whatever now holds

pub mod catalog;
pub mod evaluator;

pub use catalog::{AchievementCatalog, AchievementDefinition, Condition, SpecificRule};
pub use evaluator::AchievementEvaluator;
