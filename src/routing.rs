//! Routing Resolver (§4.2): a pure function mapping raw message text to a
//! routing target, given the current agent/team registry.

use crate::{AgentId, Registry, TeamId};
use std::sync::LazyLock;

/// Outcome of resolving a raw message's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Route directly to `agent` with the (possibly stripped) remaining text.
    DirectAgent { agent: AgentId, text: String },

    /// Route to a team's leader, tagged with the team context.
    TeamLeader {
        leader: AgentId,
        team: TeamId,
        text: String,
    },

    /// Two or more known targets were mentioned; ambiguous, no agent invoked.
    ErrorMulti { targets: Vec<String> },
}

static MENTION: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"@([A-Za-z0-9_-]+)").unwrap());

/// Resolve `text` against `registry`. Pure and deterministic (§8 invariant 5).
pub fn resolve(text: &str, registry: &Registry) -> Resolution {
    let known_mentions: Vec<&str> = MENTION
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|slug| is_known_slug(slug, registry))
        .collect();

    let mut distinct: Vec<&str> = Vec::new();
    for slug in &known_mentions {
        if !distinct.iter().any(|s| s.eq_ignore_ascii_case(slug)) {
            distinct.push(slug);
        }
    }

    if distinct.len() >= 2 {
        return Resolution::ErrorMulti {
            targets: distinct.into_iter().map(|s| s.to_string()).collect(),
        };
    }

    if let Some(prefix) = parse_leading_mention(text) {
        if let Some(resolution) = resolve_slug(&prefix.slug, &prefix.rest, registry) {
            return resolution;
        }
    }

    Resolution::DirectAgent {
        agent: "default".into(),
        text: text.to_string(),
    }
}

struct LeadingMention {
    slug: String,
    rest: String,
}

/// `text` starts with `@<slug>` immediately followed by whitespace and the
/// rest of the message. Not simply the first regex match: the mention must
/// anchor the string, not merely appear in it.
fn parse_leading_mention(text: &str) -> Option<LeadingMention> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('@')?;
    let end = rest.find(char::is_whitespace)?;
    let (slug, remainder) = rest.split_at(end);
    if slug.is_empty() {
        return None;
    }
    Some(LeadingMention {
        slug: slug.to_string(),
        rest: remainder.trim_start().to_string(),
    })
}

/// Ambiguity-detection pass (§4.2 step 1): matches only known agent ids or
/// team ids, never display names. Display names are resolved solely by
/// `resolve_slug`'s step-2 leading-prefix parse.
fn is_known_slug(slug: &str, registry: &Registry) -> bool {
    registry.agents.values().any(|a| a.id.as_ref().eq_ignore_ascii_case(slug))
        || registry.teams.values().any(|t| t.id.as_ref().eq_ignore_ascii_case(slug))
}

/// Resolve a single slug to a routing target. Tie-break order: agent id
/// (case-folded) > team id (case-folded) > agent display name (case-folded).
fn resolve_slug(slug: &str, rest: &str, registry: &Registry) -> Option<Resolution> {
    if let Some(agent) = registry
        .agents
        .values()
        .find(|a| a.id.as_ref().eq_ignore_ascii_case(slug))
    {
        return Some(Resolution::DirectAgent {
            agent: agent.id.clone(),
            text: rest.to_string(),
        });
    }

    if let Some(team) = registry
        .teams
        .values()
        .find(|t| t.id.as_ref().eq_ignore_ascii_case(slug))
    {
        return Some(Resolution::TeamLeader {
            leader: team.leader.clone(),
            team: team.id.clone(),
            text: rest.to_string(),
        });
    }

    if let Some(agent) = registry
        .agents
        .values()
        .find(|a| a.name.eq_ignore_ascii_case(slug))
    {
        return Some(Resolution::DirectAgent {
            agent: agent.id.clone(),
            text: rest.to_string(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Agent, ProviderKind, Team};
    use std::collections::HashMap;

    fn agent(id: &str, name: &str) -> Agent {
        Agent {
            id: id.into(),
            name: name.to_string(),
            provider: ProviderKind::ProviderA,
            model: "default".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: None,
            prompt_file: None,
        }
    }

    fn registry() -> Registry {
        let mut agents = HashMap::new();
        agents.insert("default".into(), agent("default", "Default"));
        agents.insert("coder".into(), agent("coder", "Coder"));
        agents.insert("reviewer".into(), agent("reviewer", "Reviewer"));

        let mut teams = HashMap::new();
        teams.insert(
            "devs".into(),
            Team {
                id: "devs".into(),
                name: "Devs".to_string(),
                members: vec!["coder".into(), "reviewer".into()],
                leader: "coder".into(),
            },
        );

        Registry { agents, teams }
    }

    #[test]
    fn no_mention_falls_back_to_default() {
        let resolution = resolve("just a plain message", &registry());
        assert_eq!(
            resolution,
            Resolution::DirectAgent {
                agent: "default".into(),
                text: "just a plain message".to_string(),
            }
        );
    }

    #[test]
    fn explicit_agent_mention_strips_prefix() {
        let resolution = resolve("@coder fix the bug", &registry());
        assert_eq!(
            resolution,
            Resolution::DirectAgent {
                agent: "coder".into(),
                text: "fix the bug".to_string(),
            }
        );
    }

    #[test]
    fn team_mention_routes_to_leader() {
        let resolution = resolve("@devs ship it", &registry());
        assert_eq!(
            resolution,
            Resolution::TeamLeader {
                leader: "coder".into(),
                team: "devs".into(),
                text: "ship it".to_string(),
            }
        );
    }

    #[test]
    fn multiple_known_mentions_are_ambiguous() {
        let resolution = resolve("hey @coder and @reviewer take a look", &registry());
        match resolution {
            Resolution::ErrorMulti { targets } => {
                assert_eq!(targets.len(), 2);
            }
            other => panic!("expected ErrorMulti, got {other:?}"),
        }
    }

    #[test]
    fn unknown_mention_does_not_count_toward_ambiguity() {
        let resolution = resolve("ping @someoneelse please", &registry());
        assert_eq!(
            resolution,
            Resolution::DirectAgent {
                agent: "default".into(),
                text: "ping @someoneelse please".to_string(),
            }
        );
    }

    #[test]
    fn display_name_mention_does_not_count_toward_ambiguity() {
        let mut registry = registry();
        registry
            .agents
            .insert("asst".into(), agent("asst", "Bot"));
        let resolution = resolve("@Bot @asst", &registry);
        assert_eq!(
            resolution,
            Resolution::DirectAgent {
                agent: "asst".into(),
                text: "@asst".to_string(),
            }
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let registry = registry();
        let a = resolve("@coder go", &registry);
        let b = resolve("@coder go", &registry);
        assert_eq!(a, b);
    }
}
