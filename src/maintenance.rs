//! Maintenance Loop (§4.8): four periodic tasks on one cooperative timer.
//! Must never starve the dispatcher — each tick does bounded work and
//! yields back to the scheduler immediately after.

use crate::config::RetryConfig;
use crate::conversation::ConversationTracker;
use crate::queue::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const STALE_CLAIM_INTERVAL: Duration = Duration::from_secs(5 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const CONVERSATION_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
#[cfg(feature = "metrics")]
const GAUGE_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Runs the maintenance loop until the process shuts down. `wake` is
/// notified after stale-claim recovery so the dispatcher can immediately
/// pick up rows that were just reset to pending, per §4.4.
pub async fn run(
    store: Arc<QueueStore>,
    conversations: ConversationTracker,
    retry: RetryConfig,
    wake: Arc<Notify>,
) {
    let mut stale_tick = tokio::time::interval(STALE_CLAIM_INTERVAL);
    let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
    let mut sweep_tick = tokio::time::interval(CONVERSATION_SWEEP_INTERVAL);
    #[cfg(feature = "metrics")]
    let mut gauge_tick = tokio::time::interval(GAUGE_SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            _ = stale_tick.tick() => {
                match store.recover_stale(retry.stale_claim_threshold_secs).await {
                    Ok(0) => {}
                    Ok(n) => {
                        tracing::info!(recovered = n, "recovered stale claims");
                        wake.notify_waiters();
                    }
                    Err(error) => tracing::warn!(%error, "stale claim recovery failed"),
                }
            }
            _ = prune_tick.tick() => {
                match store.prune_completed(retry.completed_message_retention_secs).await {
                    Ok(n) if n > 0 => tracing::debug!(pruned = n, "pruned completed messages"),
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "completed-message pruning failed"),
                }
                match store.prune_acked_responses(retry.response_retention_secs).await {
                    Ok(n) if n > 0 => tracing::debug!(pruned = n, "pruned acked responses"),
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "acked-response pruning failed"),
                }
            }
            _ = sweep_tick.tick() => {
                let reclaimed = conversations.sweep_ttl().await;
                if !reclaimed.is_empty() {
                    tracing::info!(count = reclaimed.len(), "reclaimed conversations past TTL");
                }
            }
            #[cfg(feature = "metrics")]
            _ = gauge_tick.tick() => {
                match store.pending_counts_by_agent().await {
                    Ok(counts) => {
                        let gauge = &crate::telemetry::Metrics::global().pending_queue_depth;
                        for (agent_id, count) in counts {
                            gauge.with_label_values(&[&agent_id]).set(count);
                        }
                    }
                    Err(error) => tracing::warn!(%error, "pending-depth sampling failed"),
                }
            }
        }
    }
}
