//! Agent roster — the kernel's routable agent list and per-agent
//! model/system-prompt lookup, built once from configuration at boot.
//!
//! One pass over a configured map of agents, logging each registration.
//! This kernel has no per-agent workspace concept, so there is no
//! workspace/skills scoping step to carry.

use std::collections::HashMap;

use tenex_domain::config::Config;
use tenex_domain::model::{AgentIdentity, AgentRole};

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub identity: AgentIdentity,
    pub model: String,
    pub system_prompt: String,
}

/// Built once in `bootstrap::build_app_state` and shared read-only
/// thereafter — the roster does not change for the lifetime of a
/// process; agents are configuration, not runtime state.
pub struct AgentRoster {
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRoster {
    pub fn from_config(config: &Config) -> Self {
        let mut profiles = HashMap::with_capacity(config.agents.len());
        for (id, agent_cfg) in &config.agents {
            tracing::info!(
                agent_id = %id,
                role = ?agent_cfg.role,
                model = %agent_cfg.model,
                "registered agent"
            );
            profiles.insert(
                id.clone(),
                AgentProfile {
                    identity: AgentIdentity {
                        id: id.clone(),
                        public_key: agent_cfg.public_key.clone(),
                        role: agent_cfg.role.clone(),
                    },
                    model: agent_cfg.model.clone(),
                    system_prompt: agent_cfg.system_prompt.clone(),
                },
            );
        }
        Self { profiles }
    }

    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        self.profiles.get(id)
    }

    pub fn known_agent_ids(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Public keys of every locally-hosted agent, for
    /// `EventIngress::new`'s self-authorship filter.
    pub fn local_agent_keys(&self) -> Vec<String> {
        self.profiles.values().map(|p| p.identity.public_key.clone()).collect()
    }

    pub fn is_project_manager(&self, id: &str) -> bool {
        matches!(
            self.profiles.get(id).map(|p| &p.identity.role),
            Some(AgentRole::ProjectManager)
        )
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::config::AgentConfig;

    fn config_with_one_agent() -> Config {
        let mut config = Config::default();
        config.agents.insert(
            "executor".into(),
            AgentConfig {
                public_key: "pk-executor".into(),
                role: AgentRole::Executor,
                model: "gpt-x".into(),
                system_prompt: "you execute".into(),
            },
        );
        config
    }

    #[test]
    fn builds_one_profile_per_configured_agent() {
        let roster = AgentRoster::from_config(&config_with_one_agent());
        assert_eq!(roster.len(), 1);
        let profile = roster.get("executor").unwrap();
        assert_eq!(profile.identity.public_key, "pk-executor");
        assert_eq!(profile.model, "gpt-x");
    }

    #[test]
    fn local_agent_keys_collects_every_public_key() {
        let roster = AgentRoster::from_config(&config_with_one_agent());
        assert_eq!(roster.local_agent_keys(), vec!["pk-executor".to_string()]);
    }

    #[test]
    fn empty_config_yields_empty_roster() {
        let roster = AgentRoster::from_config(&Config::default());
        assert!(roster.is_empty());
        assert!(roster.known_agent_ids().is_empty());
    }
}
