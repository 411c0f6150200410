//! Dispatcher (§4.4): claims pending rows and hands each to a per-agent
//! serial executor, guaranteeing at most one in-flight invocation per agent
//! while letting different agents run concurrently.

use crate::config::RetryConfig;
use crate::conversation::{self, ConversationTracker, OriginatingContext};
use crate::events::{Event, EventBus};
use crate::hooks::{HookContext, HookPipeline};
use crate::invoker::{self, InvokeRequest};
use crate::queue::{EnqueueMessageInput, EnqueueResponseInput, QueueStore, QueuedMessage};
use crate::routing::{self, Resolution};
use crate::{Agent, AgentId, Registry, StepRecord, TeamId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

/// Messages longer than this are spilled to a file and attached rather than
/// sent inline (§4.4 step 9).
const SINGLE_MESSAGE_SIZE_LIMIT: usize = 4000;

static SEND_FILE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[send_file:\s*([^\]]+)\]").unwrap());

/// A resolved destination for a claimed message (§4.4 step 1/3/4).
enum Target {
    Direct {
        agent: AgentId,
        team: Option<TeamId>,
    },
    Multi {
        targets: Vec<String>,
    },
}

pub struct Dispatcher {
    store: Arc<QueueStore>,
    registry: Arc<Registry>,
    conversations: ConversationTracker,
    incoming_hooks: HookPipeline,
    outgoing_hooks: HookPipeline,
    events: EventBus,
    retry: RetryConfig,
    executors: Mutex<HashMap<AgentId, mpsc::Sender<QueuedMessage>>>,
    wake: Arc<Notify>,
    executor_seq: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<QueueStore>,
        registry: Arc<Registry>,
        conversations: ConversationTracker,
        incoming_hooks: HookPipeline,
        outgoing_hooks: HookPipeline,
        events: EventBus,
        retry: RetryConfig,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            conversations,
            incoming_hooks,
            outgoing_hooks,
            events,
            retry,
            executors: Mutex::new(HashMap::new()),
            wake,
            executor_seq: AtomicUsize::new(0),
        })
    }

    /// Main claim loop: drains pending work on wake-up or a periodic tick.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.drain_pending().await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn drain_pending(self: &Arc<Self>) {
        let agent_ids = match self.store.pending_agents().await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(%error, "failed to list pending agents");
                return;
            }
        };

        for agent_id in agent_ids {
            let agent_id: AgentId = agent_id.into();
            match self.store.claim_next(&agent_id).await {
                Ok(Some(row)) => self.dispatch(agent_id, row).await,
                Ok(None) => {}
                Err(error) => tracing::error!(%error, %agent_id, "claim failed"),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, executor_key: AgentId, row: QueuedMessage) {
        let sender = self.ensure_executor(executor_key).await;
        if sender.send(row).await.is_err() {
            tracing::error!("serial executor channel closed immediately after creation");
        }
    }

    async fn ensure_executor(self: &Arc<Self>, agent_id: AgentId) -> mpsc::Sender<QueuedMessage> {
        let mut executors = self.executors.lock().await;
        if let Some(existing) = executors.get(&agent_id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel::<QueuedMessage>(64);
        let dispatcher = self.clone();
        let id = self.executor_seq.fetch_add(1, Ordering::Relaxed);
        let executor_agent = agent_id.clone();

        self.events.emit(Event::ProcessorStart {
            agent_id: agent_id.to_string(),
            timestamp: chrono::Utc::now(),
        });

        tokio::spawn(async move {
            tracing::debug!(agent_id = %executor_agent, executor = id, "serial executor started");
            while let Some(row) = rx.recv().await {
                dispatcher.process_claimed(row).await;
            }
            tracing::debug!(agent_id = %executor_agent, executor = id, "serial executor drained");
        });

        executors.insert(agent_id, tx.clone());
        tx
    }

    /// The 10-step algorithm for processing one claimed row (§4.4).
    async fn process_claimed(self: &Arc<Self>, row: QueuedMessage) {
        let row_id = row.id;
        match self.process_claimed_inner(&row).await {
            Ok(()) => {
                if let Err(error) = self.store.complete_message(row_id).await {
                    tracing::error!(%error, row_id, "failed to mark message completed");
                }
                #[cfg(feature = "metrics")]
                crate::telemetry::Metrics::global()
                    .messages_completed_total
                    .with_label_values(&[row.claimer.as_deref().unwrap_or("default")])
                    .inc();
            }
            Err(error) => {
                tracing::warn!(%error, row_id, "processing failed, will retry or dead-letter");
                match self
                    .store
                    .fail_message(row_id, &error.to_string(), self.retry.max_retries)
                    .await
                {
                    Ok(now_dead) => {
                        #[cfg(feature = "metrics")]
                        if now_dead {
                            crate::telemetry::Metrics::global()
                                .messages_dead_total
                                .with_label_values(&[row.claimer.as_deref().unwrap_or("default")])
                                .inc();
                        }
                        #[cfg(not(feature = "metrics"))]
                        let _ = now_dead;
                    }
                    Err(store_error) => {
                        tracing::error!(%store_error, row_id, "failed to record processing failure");
                    }
                }
                self.wake.notify_waiters();
            }
        }
    }

    async fn process_claimed_inner(self: &Arc<Self>, row: &QueuedMessage) -> crate::Result<()> {
        // Step 1: resolve target — trust a pre-set target, else run the resolver.
        let target = self.resolve_target(row)?;

        let (agent_id, team_id) = match target {
            Target::Multi { targets } => {
                // Step 2: short-circuit, no agent invocation.
                let explanation = format!(
                    "I can only address one target per message — you mentioned: {}.",
                    targets.join(", ")
                );
                self.enqueue_single_response(row, "multi", &explanation, Vec::new())
                    .await?;
                return Ok(());
            }
            Target::Direct { agent, team } => (agent, team),
        };

        // Step 3: unknown agent falls back to default, then first configured, else fail.
        let agent = self.resolve_agent_record(&agent_id)?;

        self.events.emit(Event::AgentRouted {
            message_id: row.message_id.clone(),
            agent_id: agent.id.to_string(),
            team_id: team_id.as_ref().map(|t| t.to_string()),
            timestamp: chrono::Utc::now(),
        });

        // Step 4: determine team context.
        let is_internal_follow_up = row.conversation_id.is_some() && row.from_agent.is_some();
        let team_context = if is_internal_follow_up {
            self.team_context_from_conversation(row).await
        } else if let Some(team_id) = &team_id {
            self.registry.teams.get(team_id.as_ref()).cloned()
        } else {
            self.registry.team_for_member(&agent.id).cloned()
        };

        // Step 5: consume per-agent reset sentinel, if present.
        let reset = consume_reset_flag(&agent);

        // Step 6: note other in-flight teammates on internal follow-ups.
        let mut prompt = row.text.clone();
        if is_internal_follow_up {
            if let Some(note) = self.other_branches_note(row, &agent.id).await {
                prompt = format!("{prompt}\n\n{note}");
            }
        }

        // Step 7: incoming hooks.
        let context = HookContext {
            channel: row.channel.clone(),
            sender: row.sender.clone(),
            message_id: row.message_id.clone(),
            original_text: row.text.clone(),
        };
        let (prompt, _incoming_metadata) = self.incoming_hooks.run(&prompt, &context);

        // Step 8: invoke.
        self.events.emit(Event::ChainStepStart {
            conversation_id: row.conversation_id.clone().unwrap_or_default(),
            agent_id: agent.id.to_string(),
            timestamp: chrono::Utc::now(),
        });

        #[cfg(feature = "metrics")]
        let invoke_started_at = std::time::Instant::now();

        let response_text = match invoker::invoke(InvokeRequest {
            agent: &agent,
            prompt,
            reset,
        })
        .await
        {
            Ok(outcome) => outcome.text,
            Err(error) => {
                tracing::error!(%error, agent_id = %agent.id, "invocation failed");
                "Sorry, something went wrong on my end handling that message.".to_string()
            }
        };

        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global()
            .invocation_duration_seconds
            .with_label_values(&[agent.id.as_ref()])
            .observe(invoke_started_at.elapsed().as_secs_f64());

        self.events.emit(Event::ChainStepDone {
            conversation_id: row.conversation_id.clone().unwrap_or_default(),
            agent_id: agent.id.to_string(),
            timestamp: chrono::Utc::now(),
        });

        match team_context {
            None => {
                // Step 9: direct reply.
                let (stripped, files) = extract_send_file_directives(&response_text);
                let (outgoing_text, outgoing_files) =
                    spill_if_oversized(&agent, &stripped, SINGLE_MESSAGE_SIZE_LIMIT)?;
                let mut files = files;
                for f in outgoing_files {
                    if !files.contains(&f) {
                        files.push(f);
                    }
                }
                self.enqueue_single_response(row, agent.id.as_ref(), &outgoing_text, files)
                    .await?;
            }
            Some(team) => {
                // Step 10: team chain bookkeeping.
                self.process_team_step(row, &agent, &team, &response_text).await?;
            }
        }

        Ok(())
    }

    fn resolve_target(&self, row: &QueuedMessage) -> crate::Result<Target> {
        if let Some(pre_set) = &row.target_agent {
            return Ok(Target::Direct {
                agent: pre_set.as_str().into(),
                team: None,
            });
        }

        match routing::resolve(&row.text, &self.registry) {
            Resolution::DirectAgent { agent, .. } => Ok(Target::Direct { agent, team: None }),
            Resolution::TeamLeader { leader, team, .. } => Ok(Target::Direct {
                agent: leader,
                team: Some(team),
            }),
            Resolution::ErrorMulti { targets } => Ok(Target::Multi { targets }),
        }
    }

    fn resolve_agent_record(&self, agent_id: &AgentId) -> crate::Result<Agent> {
        if let Some(agent) = self.registry.agents.get(agent_id) {
            return Ok(agent.clone());
        }
        if let Some(default_agent) = self.registry.default_agent() {
            return Ok(default_agent.clone());
        }
        self.registry
            .agents
            .values()
            .next()
            .cloned()
            .ok_or_else(|| crate::error::RoutingError::NoAgentsConfigured.into())
    }

    async fn team_context_from_conversation(&self, row: &QueuedMessage) -> Option<crate::Team> {
        let conversation_id = row.conversation_id.clone()?;
        let state = self.conversations.get(&conversation_id.into()).await?;
        let team_id = state.lock().await.team_id.clone();
        self.registry.teams.get(&team_id).cloned()
    }

    async fn other_branches_note(&self, row: &QueuedMessage, agent_id: &AgentId) -> Option<String> {
        let conversation_id = row.conversation_id.clone()?;
        let state = self.conversations.get(&conversation_id.into()).await?;
        let guard = state.lock().await;
        let others = guard.pending_branches.saturating_sub(1);
        if others == 0 {
            return None;
        }
        Some(format!(
            "Note: {others} other teammate(s) are also processing this conversation. \
             Don't re-mention agents who are already handling it.{}",
            if guard.outgoing_mentions.contains_key(agent_id) {
                " You were already mentioned once."
            } else {
                ""
            }
        ))
    }

    async fn process_team_step(
        self: &Arc<Self>,
        row: &QueuedMessage,
        agent: &Agent,
        team: &crate::Team,
        response_text: &str,
    ) -> crate::Result<()> {
        let conversation_id: crate::ConversationId = match &row.conversation_id {
            Some(id) => id.as_str().into(),
            None => ConversationTracker::new_conversation_id(&row.message_id),
        };

        let state = match self.conversations.get(&conversation_id).await {
            Some(state) => state,
            None => {
                self.events.emit(Event::TeamChainStart {
                    conversation_id: conversation_id.to_string(),
                    team_id: team.id.to_string(),
                    leader_agent_id: agent.id.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                self.conversations
                    .create(
                        conversation_id.clone(),
                        OriginatingContext {
                            message_id: row.message_id.clone(),
                            channel: row.channel.clone(),
                            sender: row.sender.clone(),
                            sender_id: row.sender_id.clone(),
                            original_text: row.text.clone(),
                        },
                        team,
                        1,
                    )
                    .await
            }
        };

        let (stripped, files) = extract_send_file_directives(response_text);
        let mentions = conversation::extract_mentions(&stripped, &agent.id, team);

        let (accepted_mentions, _at_capacity) = self
            .conversations
            .record_step(
                &state,
                StepRecord {
                    agent_id: agent.id.clone(),
                    agent_name: agent.name.clone(),
                    response: stripped.clone(),
                },
                files,
                mentions,
            )
            .await;

        for mention in &accepted_mentions {
            self.events.emit(Event::ChainHandoff {
                conversation_id: conversation_id.to_string(),
                from_agent_id: agent.id.to_string(),
                to_agent_id: mention.agent_id.to_string(),
                timestamp: chrono::Utc::now(),
            });

            let follow_up = EnqueueMessageInput {
                message_id: format!("{}-followup-{}", conversation_id, uuid::Uuid::new_v4()),
                channel: row.channel.clone(),
                sender: row.sender.clone(),
                sender_id: row.sender_id.clone(),
                text: mention.message.clone(),
                target_agent: Some(mention.agent_id.to_string()),
                files: Vec::new(),
                conversation_id: Some(conversation_id.to_string()),
                from_agent: Some(agent.id.to_string()),
            };
            if let Err(error) = self.store.enqueue_message(follow_up).await {
                tracing::error!(%error, "failed to enqueue team follow-up message");
            }
        }

        self.wake.notify_waiters();

        if let Some(completion) = self.conversations.complete_branch(&conversation_id).await {
            self.complete_conversation(completion).await?;
        }

        Ok(())
    }

    async fn complete_conversation(&self, completion: conversation::Completion) -> crate::Result<()> {
        let (text, _metadata) = self.outgoing_hooks.run(
            &completion.text,
            &HookContext {
                channel: completion.channel.clone(),
                sender: completion.sender.clone(),
                message_id: completion.message_id.clone(),
                original_text: completion.original_text.clone(),
            },
        );

        self.store
            .enqueue_response(EnqueueResponseInput {
                message_id: completion.message_id.clone(),
                channel: completion.channel.clone(),
                sender: completion.sender.clone(),
                sender_id: completion.sender_id.clone(),
                text,
                original_text: completion.original_text.clone(),
                agent: completion.agent.to_string(),
                files: completion.files.clone(),
                metadata: HashMap::new(),
            })
            .await?;

        self.events.emit(Event::TeamChainEnd {
            conversation_id: completion.message_id.clone(),
            team_id: completion.team_id.to_string(),
            step_count: completion.step_count,
            members: completion.members.iter().map(|m| m.to_string()).collect(),
            timestamp: chrono::Utc::now(),
        });
        self.events.emit(Event::ResponseReady {
            message_id: completion.message_id,
            channel: completion.channel,
            timestamp: chrono::Utc::now(),
        });

        Ok(())
    }

    async fn enqueue_single_response(
        &self,
        row: &QueuedMessage,
        agent: &str,
        text: &str,
        files: Vec<String>,
    ) -> crate::Result<()> {
        let context = HookContext {
            channel: row.channel.clone(),
            sender: row.sender.clone(),
            message_id: row.message_id.clone(),
            original_text: row.text.clone(),
        };
        let (text, _metadata) = self.outgoing_hooks.run(text, &context);

        self.store
            .enqueue_response(EnqueueResponseInput {
                message_id: row.message_id.clone(),
                channel: row.channel.clone(),
                sender: row.sender.clone(),
                sender_id: row.sender_id.clone(),
                text,
                original_text: row.text.clone(),
                agent: agent.to_string(),
                files,
                metadata: HashMap::new(),
            })
            .await?;

        self.events.emit(Event::ResponseReady {
            message_id: row.message_id.clone(),
            channel: row.channel.clone(),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }
}

/// `.reset` sentinel file in the agent's working directory forces a fresh
/// session on the next invocation (§4.4 step 5). Consumed (deleted) once read.
fn consume_reset_flag(agent: &Agent) -> bool {
    let path = agent.working_directory.join(".reset");
    if path.exists() {
        let _ = std::fs::remove_file(&path);
        true
    } else {
        false
    }
}

/// Strip `[send_file: <path>]` directives from `text`, returning the
/// stripped text and the deduplicated, first-appearance-ordered file list.
fn extract_send_file_directives(text: &str) -> (String, Vec<String>) {
    let mut files = Vec::new();
    for capture in SEND_FILE.captures_iter(text) {
        let path = capture.get(1).unwrap().as_str().trim().to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    let stripped = SEND_FILE.replace_all(text, "").trim().to_string();
    (stripped, files)
}

/// If `text` exceeds `limit` bytes, spill it to a file under the agent's
/// working directory and return a short note plus that file's path.
fn spill_if_oversized(agent: &Agent, text: &str, limit: usize) -> crate::Result<(String, Vec<String>)> {
    if text.len() <= limit {
        return Ok((text.to_string(), Vec::new()));
    }

    let outbox = agent.working_directory.join("outbox");
    std::fs::create_dir_all(&outbox)?;
    let path = outbox.join(format!("{}.txt", uuid::Uuid::new_v4()));
    std::fs::write(&path, text)?;

    Ok((
        "My response was too long to send inline, so I've attached it as a file.".to_string(),
        vec![path.display().to_string()],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_dedupes_send_file_directives() {
        let text = "here you go [send_file: out.txt] and also [send_file: out.txt]";
        let (stripped, files) = extract_send_file_directives(text);
        assert_eq!(files, vec!["out.txt".to_string()]);
        assert!(!stripped.contains("send_file"));
    }

    #[test]
    fn short_text_is_not_spilled() {
        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: crate::ProviderKind::ProviderA,
            model: "m".to_string(),
            working_directory: std::env::temp_dir(),
            system_prompt: None,
            prompt_file: None,
        };
        let (text, files) = spill_if_oversized(&agent, "short", 4000).unwrap();
        assert_eq!(text, "short");
        assert!(files.is_empty());
    }
}
