//! Conversation Engine (§4.5): in-memory team-chain tracking keyed by a
//! fresh conversation id, mutated under a per-conversation mutex, destroyed
//! once every branch completes or the TTL sweep reclaims it.
//!
//! Mention grammar: this tracker recognizes only the bracketed form
//! `[@slug: message]` (see DESIGN.md, Open Question 1). The bare-prefix form
//! is not recognized, avoiding ambiguity with plain `@slug` routing mentions
//! elsewhere in a response.

use crate::{AgentId, ConversationId, StepRecord, Team};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;

/// The message that originated a team conversation, kept so the final
/// composed reply can be enqueued against the same outbound row shape.
#[derive(Debug, Clone)]
pub struct OriginatingContext {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub original_text: String,
}

/// Mutable per-conversation state, guarded by its own mutex (§5: acquiring
/// it is a suspension point, never held across a subprocess invocation).
pub struct ConversationState {
    pub origin: OriginatingContext,
    pub team_id: crate::TeamId,
    /// Open Question 2: the completed conversation's outbound response row
    /// uses this team's leader agent id (see DESIGN.md).
    pub leader: AgentId,
    pub members: Vec<AgentId>,
    pub pending_branches: u32,
    pub steps: Vec<StepRecord>,
    pub files: Vec<String>,
    pub total_messages: u32,
    pub max_messages: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Slugs already mentioned by an in-flight branch, so a sibling branch's
    /// prompt can say "already being handled" instead of re-mentioning them.
    pub outgoing_mentions: HashMap<AgentId, usize>,
}

impl ConversationState {
    fn is_at_capacity(&self) -> bool {
        self.total_messages >= self.max_messages
    }
}

/// One extracted teammate mention: who to hand off to, and what to tell them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub agent_id: AgentId,
    pub message: String,
}

/// The fully composed result of a completed team conversation, ready to
/// become a single outbound response row (§4.5).
pub struct Completion {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub original_text: String,
    /// Open Question 2: the outbound row's `agent` field uses the team
    /// leader's agent id (see DESIGN.md).
    pub agent: AgentId,
    pub text: String,
    pub files: Vec<String>,
    pub team_id: crate::TeamId,
    pub step_count: usize,
    pub members: Vec<AgentId>,
}

static BRACKET_MENTION: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[@([A-Za-z0-9_-]+):\s*([^\]]*)\]").unwrap());

/// Extract teammate mentions from `response`, keeping only slugs that
/// identify a member of `team` other than `author`. Dedupes by slug,
/// preserving first-seen order (§4.5).
pub fn extract_mentions(response: &str, author: &AgentId, team: &Team) -> Vec<Mention> {
    let mut seen = std::collections::HashSet::new();
    let mut mentions = Vec::new();

    for capture in BRACKET_MENTION.captures_iter(response) {
        let slug = capture.get(1).unwrap().as_str();
        let message = capture.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();

        let Some(member) = team.members.iter().find(|m| m.as_ref().eq_ignore_ascii_case(slug)) else {
            continue;
        };
        if member == author {
            continue;
        }
        if !seen.insert(member.clone()) {
            continue;
        }
        mentions.push(Mention {
            agent_id: member.clone(),
            message,
        });
    }

    mentions
}

/// Tracks all in-flight team conversations. Agents/teams/hooks are read-only
/// after startup and need no lock; this map is the one piece of mutable,
/// concurrency-shared conversation state (§3 Process-wide state).
#[derive(Clone)]
pub struct ConversationTracker {
    conversations: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<ConversationState>>>>>,
    max_messages: u32,
    ttl: chrono::Duration,
}

impl ConversationTracker {
    pub fn new(max_messages: u32, ttl_secs: u64) -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            max_messages,
            ttl: chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    /// conversation id = originating message id + timestamp (§4.5).
    pub fn new_conversation_id(origin_message_id: &str) -> ConversationId {
        let now = chrono::Utc::now().timestamp_millis();
        format!("{origin_message_id}-{now}").into()
    }

    /// Create a new conversation, routed to `team`'s leader as the first
    /// branch with `initial_pending` branches outstanding (normally 1).
    pub async fn create(
        &self,
        id: ConversationId,
        origin: OriginatingContext,
        team: &Team,
        initial_pending: u32,
    ) -> Arc<Mutex<ConversationState>> {
        let state = Arc::new(Mutex::new(ConversationState {
            origin,
            team_id: team.id.clone(),
            leader: team.leader.clone(),
            members: team.members.clone(),
            pending_branches: initial_pending,
            steps: Vec::new(),
            files: Vec::new(),
            total_messages: 0,
            max_messages: self.max_messages,
            started_at: chrono::Utc::now(),
            outgoing_mentions: HashMap::new(),
        }));

        self.conversations.lock().await.insert(id, state.clone());
        state
    }

    pub async fn get(&self, id: &ConversationId) -> Option<Arc<Mutex<ConversationState>>> {
        self.conversations.lock().await.get(id).cloned()
    }

    /// Count of conversations currently in flight, for `GET /api/queue/status`.
    pub async fn active_count(&self) -> usize {
        self.conversations.lock().await.len()
    }

    /// Record one chain step, collect its file-send directives, and account
    /// for mentions it raises. Returns the mentions to fan out as follow-up
    /// messages (capped at the conversation's message budget) and whether
    /// the conversation is already at capacity (mentions beyond the cap are
    /// dropped and logged, per §4.5's safety cap).
    pub async fn record_step(
        &self,
        state: &Arc<Mutex<ConversationState>>,
        step: StepRecord,
        files: Vec<String>,
        mentions: Vec<Mention>,
    ) -> (Vec<Mention>, bool) {
        let mut guard = state.lock().await;
        guard.steps.push(step);
        for file in files {
            if !guard.files.contains(&file) {
                guard.files.push(file);
            }
        }
        guard.total_messages += 1;

        if mentions.is_empty() || guard.is_at_capacity() {
            if !mentions.is_empty() {
                tracing::warn!(
                    conversation_total = guard.total_messages,
                    max = guard.max_messages,
                    "conversation at capacity, dropping further mentions"
                );
            }
            return (Vec::new(), guard.is_at_capacity());
        }

        for mention in &mentions {
            *guard.outgoing_mentions.entry(mention.agent_id.clone()).or_insert(0) += 1;
        }
        guard.pending_branches += mentions.len() as u32;

        (mentions, guard.is_at_capacity())
    }

    /// Mark one branch done. Returns `Some(completion)` once every branch of
    /// this conversation has finished (pending reaches zero), removing the
    /// conversation from the map. Orphaned completions for a conversation
    /// already reclaimed by the TTL sweep are a no-op.
    pub async fn complete_branch(&self, id: &ConversationId) -> Option<Completion> {
        let Some(state) = self.get(id).await else {
            return None;
        };

        let should_complete = {
            let mut guard = state.lock().await;
            guard.pending_branches = guard.pending_branches.saturating_sub(1);
            guard.pending_branches == 0
        };

        if !should_complete {
            return None;
        }

        self.conversations.lock().await.remove(id);
        Some(self.compose(&state).await)
    }

    async fn compose(&self, state: &Arc<Mutex<ConversationState>>) -> Completion {
        let guard = state.lock().await;

        let text = guard
            .steps
            .iter()
            .map(|step| format!("**{}**: {}", step.agent_name, step.response))
            .collect::<Vec<_>>()
            .join("\n\n");

        Completion {
            message_id: guard.origin.message_id.clone(),
            channel: guard.origin.channel.clone(),
            sender: guard.origin.sender.clone(),
            sender_id: guard.origin.sender_id.clone(),
            original_text: guard.origin.original_text.clone(),
            agent: guard.leader.clone(),
            text,
            files: guard.files.clone(),
            team_id: guard.team_id.clone(),
            step_count: guard.steps.len(),
            members: guard.members.clone(),
        }
    }

    /// Periodic TTL sweep (§4.8): remove conversations older than the TTL
    /// even if branches are still pending. Returns the reclaimed ids.
    pub async fn sweep_ttl(&self) -> Vec<ConversationId> {
        let now = chrono::Utc::now();
        let mut reclaimed = Vec::new();
        let mut map = self.conversations.lock().await;

        let expired: Vec<ConversationId> = {
            let mut ids = Vec::new();
            for (id, state) in map.iter() {
                let started_at = state.lock().await.started_at;
                if now - started_at > self.ttl {
                    ids.push(id.clone());
                }
            }
            ids
        };

        for id in expired {
            map.remove(&id);
            reclaimed.push(id);
        }

        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderKind;

    fn team() -> Team {
        Team {
            id: "devs".into(),
            name: "Devs".to_string(),
            members: vec!["coder".into(), "reviewer".into()],
            leader: "coder".into(),
        }
    }

    fn origin() -> OriginatingContext {
        OriginatingContext {
            message_id: "m1".to_string(),
            channel: "telegram".to_string(),
            sender: "Alice".to_string(),
            sender_id: "alice".to_string(),
            original_text: "ship it".to_string(),
        }
    }

    #[test]
    fn extracts_bracketed_mentions_excluding_self_and_non_members() {
        let team = team();
        let response = "working on it [@reviewer: please check the diff] [@coder: noted]";
        let mentions = extract_mentions(response, &"coder".into(), &team);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].agent_id.as_ref(), "reviewer");
        assert_eq!(mentions[0].message, "please check the diff");
    }

    #[test]
    fn dedupes_repeated_mentions_keeping_first() {
        let team = team();
        let response = "[@reviewer: first] later [@reviewer: second]";
        let mentions = extract_mentions(response, &"coder".into(), &team);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].message, "first");
    }

    #[tokio::test]
    async fn completes_once_pending_branches_reach_zero() {
        let tracker = ConversationTracker::new(20, 1800);
        let team = team();
        let id = ConversationTracker::new_conversation_id("m1");
        let state = tracker.create(id.clone(), origin(), &team, 1).await;

        let _ = ProviderKind::ProviderA;
        tracker
            .record_step(
                &state,
                StepRecord {
                    agent_id: "coder".into(),
                    agent_name: "Coder Bot".to_string(),
                    response: "done".to_string(),
                },
                vec![],
                vec![],
            )
            .await;

        let completion = tracker.complete_branch(&id).await;
        let completion = completion.expect("conversation should be complete");
        assert_eq!(completion.text, "**Coder Bot**: done");
        assert!(tracker.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn mentions_beyond_capacity_are_dropped() {
        let tracker = ConversationTracker::new(1, 1800);
        let team = team();
        let id = ConversationTracker::new_conversation_id("m1");
        let state = tracker.create(id.clone(), origin(), &team, 1).await;

        let (accepted, at_capacity) = tracker
            .record_step(
                &state,
                StepRecord {
                    agent_id: "coder".into(),
                    agent_name: "Coder Bot".to_string(),
                    response: "done".to_string(),
                },
                vec![],
                vec![Mention {
                    agent_id: "reviewer".into(),
                    message: "look".to_string(),
                }],
            )
            .await;

        assert!(accepted.is_empty());
        assert!(at_capacity);
    }

    #[tokio::test]
    async fn ttl_sweep_reclaims_old_conversations() {
        let tracker = ConversationTracker::new(20, 0);
        let team = team();
        let id = ConversationTracker::new_conversation_id("m1");
        tracker.create(id.clone(), origin(), &team, 1).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let reclaimed = tracker.sweep_ttl().await;
        assert_eq!(reclaimed, vec![id]);
    }
}
