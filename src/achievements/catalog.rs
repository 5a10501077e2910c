//! Achievement catalog
//!
//! Rules are static: they ship in `files/achievements.toml`, are embedded at
//! compile time and seeded into the database by slug.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{Difficulty, SubmissionStatus};

/// Rules that do not fit a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecificRule {
    /// Accepted on the first attempt at a problem
    OneShot,
    /// Accepted after at least 10 earlier attempts at the problem
    Persistence,
}

/// Unlock condition of one achievement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Total problems solved reaches `solved`
    Count { solved: i64 },
    /// Submission finished with `status`; any status when absent
    Status {
        #[serde(default)]
        status: Option<SubmissionStatus>,
    },
    /// Problems of `difficulty` solved reaches `count`
    DifficultyCount { difficulty: Difficulty, count: i64 },
    /// Current solving streak reaches `days`
    Streak { days: i64 },
    Specific { rule: SpecificRule },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Count { .. } => "count",
            Condition::Status { .. } => "status",
            Condition::DifficultyCount { .. } => "difficulty_count",
            Condition::Streak { .. } => "streak",
            Condition::Specific { .. } => "specific",
        }
    }

    /// Condition payload as stored in `achievements.condition_value`.
    pub fn value(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("kind");
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementDefinition {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub xp_reward: i32,
    #[serde(default)]
    pub icon_url: Option<String>,
    pub condition: Condition,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    achievement: Vec<AchievementDefinition>,
}

#[derive(Debug, Clone)]
pub struct AchievementCatalog {
    definitions: Vec<AchievementDefinition>,
}

impl AchievementCatalog {
    /// Catalog embedded from `files/achievements.toml`
    pub fn builtin() -> Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/achievements.toml"));
        Self::from_toml(content).context("Failed to parse embedded achievement catalog")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawCatalog = toml::from_str(content)?;
        Self::new(raw.achievement)
    }

    pub fn new(definitions: Vec<AchievementDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &definitions {
            if !seen.insert(def.slug.as_str()) {
                anyhow::bail!("Duplicate achievement slug: {}", def.slug);
            }
            if def.xp_reward < 0 {
                anyhow::bail!("Negative xp_reward for achievement {}", def.slug);
            }
        }
        Ok(Self { definitions })
    }

    pub fn definitions(&self) -> &[AchievementDefinition] {
        &self.definitions
    }

    pub fn get(&self, slug: &str) -> Option<&AchievementDefinition> {
        self.definitions.iter().find(|d| d.slug == slug)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
