//! waypoint: a durable message queue and routing daemon that dispatches
//! human-facing messages to AI coding-assistant subprocesses.

pub mod config;
pub mod conversation;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hooks;
pub mod invoker;
pub mod maintenance;
pub mod queue;
pub mod routing;

pub mod api;
#[cfg(feature = "metrics")]
pub mod telemetry;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Agent identifier: a short lowercase slug, stable for the process lifetime.
pub type AgentId = Arc<str>;

/// Team identifier: a short lowercase slug.
pub type TeamId = Arc<str>;

/// Conversation identifier: `{originating_message_id}-{timestamp}`.
pub type ConversationId = Arc<str>;

/// A single configured agent (§3 Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    pub working_directory: std::path::PathBuf,
    pub system_prompt: Option<String>,
    pub prompt_file: Option<std::path::PathBuf>,
}

/// The three supported subprocess provider shapes (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Conversational CLI with a `--continue` switch, plain-text stdout.
    ProviderA,
    /// Session CLI with `resume --last`, JSONL stdout.
    ProviderB,
    /// Alternate session CLI, JSON stdout.
    ProviderC,
}

/// A named group of agents with a designated leader (§3 Team).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub members: Vec<AgentId>,
    pub leader: AgentId,
}

impl Team {
    /// Validates the team invariants: leader is a member, members are unique.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.members.contains(&self.leader) {
            return Err(format!(
                "team {} leader {} is not a member",
                self.id, self.leader
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for member in &self.members {
            if !seen.insert(member.clone()) {
                return Err(format!("team {} has duplicate member {member}", self.id));
            }
        }
        Ok(())
    }
}

/// Read-only registry of agents and teams, loaded once at startup (§3 Process-wide state).
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub agents: HashMap<AgentId, Agent>,
    pub teams: HashMap<TeamId, Team>,
}

impl Registry {
    pub fn default_agent(&self) -> Option<&Agent> {
        self.agents
            .get("default")
            .or_else(|| self.agents.values().next())
    }

    /// The first team of which `agent_id` is a member, if any.
    pub fn team_for_member(&self, agent_id: &str) -> Option<&Team> {
        self.teams
            .values()
            .find(|team| team.members.iter().any(|m| m.as_ref() == agent_id))
    }
}

/// An inbound message entering the system from an adapter or internal follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub message_id: String,
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub agent: Option<AgentId>,
}

/// An outbound response ready for an adapter to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub message_id: String,
    pub message: String,
    pub original_message: String,
    pub agent: AgentId,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One step in a team conversation: the agent that produced it and its text.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub response: String,
}
