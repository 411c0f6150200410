//! Global metrics registry and metric handle definitions.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use std::sync::LazyLock;

/// Global metrics instance. Initialized once, accessed from any call site.
static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for the waypoint process.
///
/// Access via `Metrics::global()`. Metric handles are cheap to clone (Arc
/// internally) so call sites can grab references without threading state.
pub struct Metrics {
    pub(crate) registry: Registry,

    /// Messages enqueued, labeled by channel.
    pub messages_enqueued_total: IntCounterVec,

    /// Messages claimed for processing, labeled by agent_id.
    pub messages_claimed_total: IntCounterVec,

    /// Messages that reached status=completed, labeled by agent_id.
    pub messages_completed_total: IntCounterVec,

    /// Messages dead-lettered after exhausting retries, labeled by agent_id.
    pub messages_dead_total: IntCounterVec,

    /// Agent subprocess invocation duration in seconds, labeled by agent_id.
    pub invocation_duration_seconds: HistogramVec,

    /// Pending queue depth per agent, sampled by the maintenance loop.
    pub pending_queue_depth: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let messages_enqueued_total = IntCounterVec::new(
            Opts::new("waypoint_messages_enqueued_total", "Total messages enqueued"),
            &["channel"],
        )
        .expect("hardcoded metric descriptor");

        let messages_claimed_total = IntCounterVec::new(
            Opts::new("waypoint_messages_claimed_total", "Total messages claimed"),
            &["agent_id"],
        )
        .expect("hardcoded metric descriptor");

        let messages_completed_total = IntCounterVec::new(
            Opts::new("waypoint_messages_completed_total", "Total messages completed"),
            &["agent_id"],
        )
        .expect("hardcoded metric descriptor");

        let messages_dead_total = IntCounterVec::new(
            Opts::new("waypoint_messages_dead_total", "Total messages dead-lettered"),
            &["agent_id"],
        )
        .expect("hardcoded metric descriptor");

        let invocation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "waypoint_invocation_duration_seconds",
                "Agent subprocess invocation duration in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["agent_id"],
        )
        .expect("hardcoded metric descriptor");

        let pending_queue_depth = IntGaugeVec::new(
            Opts::new("waypoint_pending_queue_depth", "Pending messages per agent"),
            &["agent_id"],
        )
        .expect("hardcoded metric descriptor");

        registry
            .register(Box::new(messages_enqueued_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(messages_claimed_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(messages_completed_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(messages_dead_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(invocation_duration_seconds.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(pending_queue_depth.clone()))
            .expect("hardcoded metric");

        Self {
            registry,
            messages_enqueued_total,
            messages_claimed_total,
            messages_completed_total,
            messages_dead_total,
            invocation_duration_seconds,
            pending_queue_depth,
        }
    }

    /// Access the global metrics instance.
    pub fn global() -> &'static Metrics {
        &METRICS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_metrics_are_registered_once_and_reused() {
        let first = Metrics::global();
        let second = Metrics::global();
        first
            .messages_enqueued_total
            .with_label_values(&["telegram"])
            .inc();
        assert_eq!(
            second
                .messages_enqueued_total
                .with_label_values(&["telegram"])
                .get(),
            1
        );
    }
}
