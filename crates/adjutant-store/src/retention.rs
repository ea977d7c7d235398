//! Background pruning of old events.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::events::EventStore;

/// How long events live and how often they are pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 7,
            interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Shortest accepted gap between prune passes.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Prune once now, then every `policy.interval`, until the handle is aborted.
///
/// A failed pass is logged and the next tick tries again. Intervals below
/// one second are raised to one second.
#[must_use]
pub fn spawn_retention(store: EventStore, policy: RetentionPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.prune_older_than(policy.max_age_days).await {
                Ok(0) => tracing::debug!("Event retention: nothing to prune"),
                Ok(deleted) => tracing::info!(
                    deleted,
                    max_age_days = policy.max_age_days,
                    "Pruned old events"
                ),
                Err(e) => tracing::error!(error = %e, "Event retention pass failed"),
            }
        }
    })
}
