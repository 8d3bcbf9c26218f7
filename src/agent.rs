//! Agent identity, specialization and health types.
//!
//! Agents are external workers; the coordinator only knows what they
//! declared at registration and what the agent-pool manager reports.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared domain of competence of an agent, and the domain a task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    #[default]
    General,
    Documentation,
    Integration,
    Quality,
    Testing,
    Security,
    Architecture,
    Performance,
}

impl Specialization {
    pub const ALL: [Specialization; 8] = [
        Specialization::General,
        Specialization::Documentation,
        Specialization::Integration,
        Specialization::Quality,
        Specialization::Testing,
        Specialization::Security,
        Specialization::Architecture,
        Specialization::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::General => "general",
            Specialization::Documentation => "documentation",
            Specialization::Integration => "integration",
            Specialization::Quality => "quality",
            Specialization::Testing => "testing",
            Specialization::Security => "security",
            Specialization::Architecture => "architecture",
            Specialization::Performance => "performance",
        }
    }
}

impl std::fmt::Display for Specialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Specialization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Specialization::ALL
            .into_iter()
            .find(|spec| spec.as_str() == wanted)
            .ok_or_else(|| Error::Validation(format!("unknown specialization: {}", s)))
    }
}

/// Health as reported by the external agent-pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    #[default]
    Healthy,
    /// Still routable, but struggling.
    Degraded,
    Unhealthy,
    Offline,
}

impl AgentHealth {
    /// Whether tasks may be routed to an agent in this state.
    pub fn is_routable(&self) -> bool {
        matches!(self, AgentHealth::Healthy | AgentHealth::Degraded)
    }
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Degraded => write!(f, "degraded"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
            AgentHealth::Offline => write!(f, "offline"),
        }
    }
}

/// Capabilities an agent declares when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub specialization: Specialization,
    /// Skill level in [0, 1].
    pub skill_level: f64,
    pub max_concurrent_tasks: usize,
    /// Step size for skill nudging; the registry default applies when absent.
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

impl AgentCapabilities {
    pub fn new(specialization: Specialization, skill_level: f64) -> Self {
        Self {
            specialization,
            skill_level,
            max_concurrent_tasks: 1,
            learning_rate: None,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = Some(rate);
        self
    }

    /// Reject malformed declarations.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.skill_level) {
            return Err(Error::Validation(format!(
                "skill level must be within [0, 1], got {}",
                self.skill_level
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Validation(
                "max concurrent tasks must be at least 1".to_string(),
            ));
        }
        if let Some(rate) = self.learning_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::Validation(format!(
                    "learning rate must be within [0, 1], got {}",
                    rate
                )));
            }
        }
        Ok(())
    }
}
