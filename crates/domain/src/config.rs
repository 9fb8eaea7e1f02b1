//! Kernel configuration: one struct per concern, assembled into a
//! top-level [`Config`] with field-level defaults, loaded from TOML,
//! and checked by [`Config::validate`] before the kernel boots.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::AgentRole;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub termination: TerminationConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Agent id -> its identity/routing configuration. `AgentId` is
    /// opaque everywhere else in the kernel, but routing needs a
    /// concrete roster to route against.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

impl Config {
    /// Load from the TOML file at `path`, or fall back to defaults if
    /// the file does not exist. One shared helper used by every
    /// subcommand that needs a `Config`.
    pub fn load_or_default(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
        } else {
            Ok(Self::default())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    /// Opaque project identifier. Required — the kernel owns exactly
    /// one project per process (single-node ownership).
    pub id: String,
    /// Author keys the kernel will accept events from, in addition to
    /// whatever the bus filter already narrows.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock / ExecutionQueue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "d_lock_max_duration_ms")]
    pub max_duration_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: d_lock_max_duration_ms(),
        }
    }
}

fn d_lock_max_duration_ms() -> u64 {
    1_800_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default average execution time used for ETA math when no
    /// history is available yet.
    #[serde(default = "d_queue_avg_exec_hint_ms")]
    pub avg_exec_hint_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            avg_exec_hint_ms: d_queue_avg_exec_hint_ms(),
        }
    }
}

fn d_queue_avg_exec_hint_ms() -> u64 {
    600_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Termination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "d_termination_max_attempts")]
    pub max_attempts: u32,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_attempts: d_termination_max_attempts(),
        }
    }
}

fn d_termination_max_attempts() -> u32 {
    2
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream / typing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "d_stream_flush_delay_ms")]
    pub flush_delay_ms: u64,
    /// Upper bound the flush window may widen to under backpressure —
    /// batching windows widen up to this configurable cap.
    #[serde(default = "d_stream_max_flush_delay_ms")]
    pub max_flush_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: d_stream_flush_delay_ms(),
            max_flush_delay_ms: d_stream_max_flush_delay_ms(),
        }
    }
}

fn d_stream_flush_delay_ms() -> u64 {
    100
}

fn d_stream_max_flush_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "d_typing_min_visible_ms")]
    pub min_visible_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            min_visible_ms: d_typing_min_visible_ms(),
        }
    }
}

fn d_typing_min_visible_ms() -> u64 {
    5_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store — persistence root for the persisted-state-layout contract.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_store_path")]
    pub path: std::path::PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: d_store_path(),
        }
    }
}

fn d_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("./tenex-state")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "d_orchestrator_model")]
    pub model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: d_orchestrator_model(),
        }
    }
}

fn d_orchestrator_model() -> String {
    "orchestrator-default".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent roster — one entry per routable agent.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub public_key: String,
    pub role: AgentRole,
    #[serde(default = "d_agent_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

fn d_agent_model() -> String {
    "agent-default".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. An
    /// empty vec means the config is fit to boot the kernel.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.project.id.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "project.id".into(),
                message: "project.id must not be empty".into(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for key in &self.project.whitelist {
            if key.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: "project.whitelist".into(),
                    message: "empty author key entry will never match".into(),
                });
            } else if !seen.insert(key) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: "project.whitelist".into(),
                    message: format!("duplicate author key \"{key}\""),
                });
            }
        }

        if self.lock.max_duration_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "lock.max_duration_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.termination.max_attempts == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "termination.max_attempts".into(),
                message: "0 means every non-terminated turn is auto-completed immediately"
                    .into(),
            });
        }

        if self.stream.max_flush_delay_ms < self.stream.flush_delay_ms {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "stream.max_flush_delay_ms".into(),
                message: "must be >= stream.flush_delay_ms".into(),
            });
        }

        if self.typing.min_visible_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "typing.min_visible_ms".into(),
                message: "0 disables the minimum-visible-duration debounce".into(),
            });
        }

        if self.agents.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "agents".into(),
                message: "no agents configured — the orchestrator has nothing to route to"
                    .into(),
            });
        }
        let mut seen_keys: HashSet<&str> = HashSet::new();
        for (id, agent) in &self.agents {
            if agent.public_key.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("agents.{id}.public_key"),
                    message: "must not be empty".into(),
                });
            } else if !seen_keys.insert(&agent.public_key) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("agents.{id}.public_key"),
                    message: "duplicate public_key across agents".into(),
                });
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let c = Config::default();
        assert_eq!(c.lock.max_duration_ms, 1_800_000);
        assert_eq!(c.termination.max_attempts, 2);
        assert_eq!(c.stream.flush_delay_ms, 100);
        assert_eq!(c.typing.min_visible_ms, 5_000);
        assert_eq!(c.queue.avg_exec_hint_ms, 600_000);
    }

    #[test]
    fn empty_project_id_is_an_error() {
        let c = Config::default();
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "project.id"));
    }

    #[test]
    fn valid_config_has_no_errors() {
        let mut c = Config::default();
        c.project.id = "proj-1".into();
        let issues = c.validate();
        assert!(!issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn duplicate_whitelist_entries_warn() {
        let mut c = Config::default();
        c.project.id = "proj-1".into();
        c.project.whitelist = vec!["key1".into(), "key1".into()];
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.field == "project.whitelist"));
    }

    #[test]
    fn empty_roster_warns_but_does_not_error() {
        let mut c = Config::default();
        c.project.id = "proj-1".into();
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.field == "agents"));
    }

    #[test]
    fn duplicate_agent_public_keys_are_an_error() {
        let mut c = Config::default();
        c.project.id = "proj-1".into();
        c.agents.insert(
            "executor".into(),
            AgentConfig {
                public_key: "dup-key".into(),
                role: AgentRole::Executor,
                model: "m".into(),
                system_prompt: "you execute".into(),
            },
        );
        c.agents.insert(
            "planner".into(),
            AgentConfig {
                public_key: "dup-key".into(),
                role: AgentRole::Planner,
                model: "m".into(),
                system_prompt: "you plan".into(),
            },
        );
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field.contains("public_key")));
    }

    #[test]
    fn round_trip_toml() {
        let mut c = Config::default();
        c.project.id = "proj-1".into();
        let toml_str = toml::to_string(&c).unwrap();
        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.project.id, "proj-1");
        assert_eq!(reparsed.lock.max_duration_ms, c.lock.max_duration_ms);
    }
}
