//! Reclaim loop for grouped subscriptions.
//!
//! Periodically transfers entries that other consumers left pending longer
//! than `min_idle` to this consumer, then wakes the read loop, which delivers
//! them through its own-pending replay. Also removes consumers idle longer
//! than `consumer_timeout` that hold no pending entries.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::LoopContext;
use crate::storage::{EntryId, PendingEntry};

pub(crate) async fn run(mut ctx: LoopContext) {
    let config = Arc::clone(&ctx.config);

    let mut claim_tick = interval_at(Instant::now() + config.claim_interval, config.claim_interval);
    claim_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cleanup = !config.consumer_timeout.is_zero();
    let mut cleanup_tick = interval_at(
        Instant::now() + config.check_consumers_interval,
        config.check_consumers_interval,
    );
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        claim_interval = ?config.claim_interval,
        min_idle = ?config.min_idle,
        "Reclaim loop started"
    );

    loop {
        tokio::select! {
            _ = ctx.stopped() => break,
            _ = claim_tick.tick() => claim_idle_entries(&ctx).await,
            _ = cleanup_tick.tick(), if cleanup => remove_idle_consumers(&ctx).await,
        }
    }

    debug!("Reclaim loop stopped");
}

/// Whether a pending entry should be taken over by this consumer.
///
/// Own entries are excluded: the read loop redelivers those itself.
fn is_candidate(ctx: &LoopContext, entry: &PendingEntry) -> bool {
    if entry.consumer == ctx.consumer {
        return false;
    }
    match &ctx.config.should_claim {
        Some(accept) => accept(entry),
        None => true,
    }
}

/// Page through the pending entry list until a page yields candidates or
/// the list runs out.
///
/// Entries this consumer keeps pending (malformed ones, for instance) sit at
/// the head of the list for good, so a single page could hide every other
/// consumer's entries behind them.
async fn find_candidates(ctx: &LoopContext) -> Option<Vec<EntryId>> {
    let config = &ctx.config;
    let mut after = EntryId::MIN;
    loop {
        let page = match config
            .retry
            .run("list_pending", || {
                ctx.store.list_pending(
                    &ctx.topic,
                    &ctx.group,
                    config.min_idle,
                    after,
                    config.claim_batch_size,
                )
            })
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "Failed to list pending entries");
                return None;
            }
        };

        let Some(last) = page.last() else {
            return Some(Vec::new());
        };
        after = last.id;

        let candidates: Vec<EntryId> = page
            .iter()
            .filter(|entry| is_candidate(ctx, entry))
            .map(|entry| entry.id)
            .collect();
        if !candidates.is_empty() || page.len() < config.claim_batch_size {
            return Some(candidates);
        }
    }
}

async fn claim_idle_entries(ctx: &LoopContext) {
    let Some(candidates) = find_candidates(ctx).await else {
        return;
    };
    if candidates.is_empty() {
        return;
    }
    let config = &ctx.config;

    // The store re-checks idleness, so entries acked or claimed meanwhile are left alone.
    let claimed = config
        .retry
        .run("reclaim", || {
            ctx.store.reclaim(
                &ctx.topic,
                &ctx.group,
                &ctx.consumer,
                config.min_idle,
                &candidates,
            )
        })
        .await;

    match claimed {
        Ok(claimed) if claimed.is_empty() => {
            debug!(candidates = candidates.len(), "No idle entries left to reclaim");
        }
        Ok(claimed) => {
            info!(
                count = claimed.len(),
                first_entry_id = %claimed[0].id,
                "Reclaimed idle entries"
            );
            ctx.claimed.notify_one();
        }
        Err(e) => warn!(error = %e, "Failed to reclaim idle entries"),
    }
}

async fn remove_idle_consumers(ctx: &LoopContext) {
    let config = &ctx.config;
    let timeout = config.consumer_timeout;
    let consumers = match config
        .retry
        .run("list_consumers", || {
            ctx.store.list_consumers(&ctx.topic, &ctx.group)
        })
        .await
    {
        Ok(consumers) => consumers,
        Err(e) => {
            warn!(error = %e, "Failed to list consumers");
            return;
        }
    };

    // Consumers still holding entries are kept: deleting them would drop those entries.
    let idle = consumers
        .iter()
        .filter(|c| c.name != ctx.consumer && c.idle > timeout && c.pending == 0);
    for consumer in idle {
        let deleted = config
            .retry
            .run("delete_consumer", || {
                ctx.store
                    .delete_consumer(&ctx.topic, &ctx.group, &consumer.name)
            })
            .await;
        match deleted {
            Ok(0) => info!(
                idle_consumer = %consumer.name,
                idle = ?consumer.idle,
                "Removed idle consumer"
            ),
            Ok(dropped) => error!(
                idle_consumer = %consumer.name,
                dropped,
                "Removed idle consumer that had just taken pending entries"
            ),
            Err(e) => warn!(idle_consumer = %consumer.name, error = %e, "Failed to remove idle consumer"),
        }
    }
}
