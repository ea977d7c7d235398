//! Role and address lookup for agents.
//!
//! Agents identify themselves with free-form role strings and slash-separated
//! addresses such as `rig/polecats/toast`. A [`Topology`] turns those into
//! structured values. It is constructed once at startup and handed to the
//! components that need it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Normalized agent role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Supervisor,
    Monitor,
    Merger,
    Worker,
    Crew,
    Overseer,
    Unknown,
}

/// Structured form of an agent address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAddress {
    /// Project ("rig") the agent belongs to, if any.
    pub rig: Option<String>,
    pub role: AgentRole,
    /// Individual agent name for roles that have several members.
    pub name: Option<String>,
}

/// Lookup from raw identifiers to structured topology.
pub trait Topology: Send + Sync {
    /// Map a raw role string to a normalized role.
    fn normalize_role(&self, raw: &str) -> AgentRole;

    /// Parse an agent address. Returns `None` for empty or malformed input.
    fn parse_address(&self, address: &str) -> Option<AgentAddress>;
}

const DEFAULT_ALIASES: &[(&str, AgentRole)] = &[
    ("mayor", AgentRole::Coordinator),
    ("coordinator", AgentRole::Coordinator),
    ("deacon", AgentRole::Supervisor),
    ("supervisor", AgentRole::Supervisor),
    ("witness", AgentRole::Monitor),
    ("monitor", AgentRole::Monitor),
    ("refinery", AgentRole::Merger),
    ("merger", AgentRole::Merger),
    ("polecat", AgentRole::Worker),
    ("polecats", AgentRole::Worker),
    ("worker", AgentRole::Worker),
    ("crew", AgentRole::Crew),
    ("human", AgentRole::Overseer),
    ("overseer", AgentRole::Overseer),
    ("user", AgentRole::Overseer),
];

/// Alias-table topology.
#[derive(Debug, Clone)]
pub struct DefaultTopology {
    aliases: HashMap<String, AgentRole>,
}

impl Default for DefaultTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultTopology {
    /// Create a topology with the built-in alias table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(alias, role)| ((*alias).to_string(), *role))
                .collect(),
        }
    }

    /// Add or override an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: &str, role: AgentRole) -> Self {
        self.aliases.insert(alias.trim().to_ascii_lowercase(), role);
        self
    }

    const fn is_singleton(role: AgentRole) -> bool {
        matches!(
            role,
            AgentRole::Coordinator | AgentRole::Supervisor | AgentRole::Monitor | AgentRole::Merger
        )
    }
}

impl Topology for DefaultTopology {
    fn normalize_role(&self, raw: &str) -> AgentRole {
        self.aliases
            .get(&raw.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(AgentRole::Unknown)
    }

    fn parse_address(&self, address: &str) -> Option<AgentAddress> {
        let parts: Vec<&str> = address
            .trim()
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            [] => None,
            // "mayor/" or "overseer"
            [only] => {
                let role = self.normalize_role(only);
                (role != AgentRole::Unknown).then(|| AgentAddress {
                    rig: None,
                    role,
                    name: None,
                })
            }
            // "rig/witness", or "rig/name" for a bare worker
            [rig, second] => {
                let role = self.normalize_role(second);
                if Self::is_singleton(role) {
                    Some(AgentAddress {
                        rig: Some((*rig).to_string()),
                        role,
                        name: None,
                    })
                } else if role == AgentRole::Unknown {
                    Some(AgentAddress {
                        rig: Some((*rig).to_string()),
                        role: AgentRole::Worker,
                        name: Some((*second).to_string()),
                    })
                } else {
                    None
                }
            }
            // "rig/polecats/name", "rig/crew/name"
            [rig, role, name] => {
                let role = self.normalize_role(role);
                matches!(role, AgentRole::Worker | AgentRole::Crew).then(|| AgentAddress {
                    rig: Some((*rig).to_string()),
                    role,
                    name: Some((*name).to_string()),
                })
            }
            _ => None,
        }
    }
}
