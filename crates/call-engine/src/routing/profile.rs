//! Worker profiles for the routing pool.

use serde::{Deserialize, Serialize};

/// Ordered skill tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillTier {
    Junior,
    Intermediate,
    Senior,
    Specialist,
    Supervisor,
}

impl SkillTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillTier::Junior => "junior",
            SkillTier::Intermediate => "intermediate",
            SkillTier::Senior => "senior",
            SkillTier::Specialist => "specialist",
            SkillTier::Supervisor => "supervisor",
        }
    }
}

impl std::fmt::Display for SkillTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human or AI worker the engine can route calls to.
///
/// Owned by the routing engine's pool; load is mutated only by the engine
/// on assignment and release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub worker_id: String,
    pub name: String,
    pub tier: SkillTier,
    pub specializations: Vec<String>,
    pub languages: Vec<String>,
    pub current_load: u32,
    pub max_capacity: u32,
    pub availability: bool,
    /// 0.0 to 1.0.
    pub performance_score: f64,
}

impl WorkerProfile {
    pub fn is_available(&self) -> bool {
        self.availability && self.current_load < self.max_capacity
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_capacity == 0 {
            0.0
        } else {
            (self.current_load as f64 / self.max_capacity as f64) * 100.0
        }
    }

    pub fn speaks(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }

    pub fn has_specialization(&self, specialization: &str) -> bool {
        self.specializations
            .iter()
            .any(|s| s == specialization || s == "all")
    }
}
