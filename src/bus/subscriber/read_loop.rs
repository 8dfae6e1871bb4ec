//! Read loop: fetch entries for this consumer and hand them out one at a time.
//!
//! The consumer's own pending entries are delivered first: on start, after a
//! nack, and after the reclaim loop transferred entries to this consumer.
//! Then new entries are read with a bounded blocking read. Each delivery
//! waits for its ack or nack before the next one is handed out.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::{cancelled, group, LoopContext, SubscriptionState};
use crate::bus::envelope::AckSignal;
use crate::bus::Delivery;
use crate::storage::{EntryId, ReadCursor, StoreError, StreamEntry};

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Nacked,
    /// Not handed out: malformed, or trimmed from the stream.
    Skipped,
    Stopped,
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Done,
    Nacked,
    Stopped,
}

pub(crate) async fn run(mut ctx: LoopContext) {
    let claimed = Arc::clone(&ctx.claimed);
    ctx.state.set(SubscriptionState::Reading);
    debug!("Read loop started");

    let mut replay = true;
    loop {
        if ctx.is_stopped() {
            break;
        }

        if replay {
            match replay_pending(&mut ctx).await {
                Pass::Done => replay = false,
                Pass::Nacked => {
                    if !pause(&mut ctx).await {
                        break;
                    }
                }
                Pass::Stopped => break,
            }
            continue;
        }

        let entries = tokio::select! {
            entries = read(&mut ctx, ReadCursor::New) => entries,
            _ = claimed.notified() => {
                replay = true;
                continue;
            }
        };
        let Some(entries) = entries else {
            break;
        };
        if entries.is_empty() {
            continue;
        }

        match deliver_batch(&mut ctx, entries, false).await {
            Pass::Done => {}
            Pass::Nacked => {
                replay = true;
                if !pause(&mut ctx).await {
                    break;
                }
            }
            Pass::Stopped => break,
        }
    }

    ctx.state.set(SubscriptionState::Closing);
    // Stops the reclaim loop too when the read loop ended on its own.
    ctx.cancel_tx.send_replace(true);
    ctx.state.set(SubscriptionState::Closed);
    debug!("Read loop stopped");
}

/// Deliver every entry this consumer holds pending, oldest first.
async fn replay_pending(ctx: &mut LoopContext) -> Pass {
    let mut after = EntryId::MIN;
    loop {
        let Some(entries) = read(ctx, ReadCursor::Pending(after)).await else {
            return Pass::Stopped;
        };
        let Some(last) = entries.last() else {
            return Pass::Done;
        };
        after = last.id;

        match deliver_batch(ctx, entries, true).await {
            Pass::Done => {}
            other => return other,
        }
    }
}

/// Deliver a batch in order, stopping at the first nack.
///
/// Entries after a nacked one stay pending and are replayed.
async fn deliver_batch(ctx: &mut LoopContext, entries: Vec<StreamEntry>, redelivered: bool) -> Pass {
    ctx.state.set(SubscriptionState::Delivering);
    let mut pass = Pass::Done;
    for entry in entries {
        match deliver(ctx, entry, redelivered).await {
            Outcome::Acked | Outcome::Skipped => {}
            Outcome::Nacked => {
                pass = Pass::Nacked;
                break;
            }
            Outcome::Stopped => {
                pass = Pass::Stopped;
                break;
            }
        }
    }
    if pass != Pass::Stopped {
        ctx.state.set(SubscriptionState::Reading);
    }
    pass
}

async fn deliver(ctx: &mut LoopContext, entry: StreamEntry, redelivered: bool) -> Outcome {
    if ctx.is_stopped() {
        return Outcome::Stopped;
    }

    let entry_id = entry.id;
    if entry.fields.is_empty() {
        // Trimmed from the stream while pending: nothing left to deliver.
        debug!(entry_id = %entry_id, "Acknowledging trimmed entry");
        acknowledge(ctx, entry_id).await;
        return Outcome::Skipped;
    }

    let envelope = match ctx.marshaler.unmarshal(&entry.fields) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(entry_id = %entry_id, error = %e, "Skipping malformed entry");
            return Outcome::Skipped;
        }
    };

    let (delivery, mut verdict) = Delivery::new(envelope, entry_id, redelivered);
    let sent = tokio::select! {
        biased;
        _ = cancelled(&mut ctx.cancel) => false,
        sent = ctx.output.send(delivery) => sent.is_ok(),
    };
    if !sent {
        return Outcome::Stopped;
    }

    let answered = tokio::select! {
        answer = &mut verdict => Some(answer),
        _ = cancelled(&mut ctx.cancel) => None,
    };
    let answer = match answered {
        Some(answer) => answer,
        None => {
            ctx.state.set(SubscriptionState::Closing);
            match timeout(ctx.config.close_timeout, verdict).await {
                Ok(answer) => answer,
                Err(_) => {
                    debug!(entry_id = %entry_id, "No acknowledgment before close, entry stays pending");
                    return Outcome::Stopped;
                }
            }
        }
    };

    match answer {
        Ok(AckSignal::Ack) => {
            acknowledge(ctx, entry_id).await;
            Outcome::Acked
        }
        Ok(AckSignal::Nack) => {
            debug!(entry_id = %entry_id, "Entry nacked");
            Outcome::Nacked
        }
        Err(_) => {
            debug!(entry_id = %entry_id, "Delivery dropped without acknowledgment");
            Outcome::Nacked
        }
    }
}

/// Group read with retry. `None` ends the loop: cancelled, or the store gave out.
async fn read(ctx: &mut LoopContext, cursor: ReadCursor) -> Option<Vec<StreamEntry>> {
    let block = match cursor {
        ReadCursor::New => Some(ctx.config.block_time),
        ReadCursor::Pending(_) => None,
    };
    let mut cancel = ctx.cancel.clone();
    let mut recreated = false;

    loop {
        let fetch = ctx.config.retry.run("read_group", || {
            ctx.reader.read_group(
                &ctx.topic,
                &ctx.group,
                &ctx.consumer,
                cursor,
                block,
                ctx.config.read_batch_size,
            )
        });
        let result = tokio::select! {
            result = fetch => result,
            _ = cancelled(&mut cancel) => return None,
            _ = ctx.output.closed() => return None,
        };

        match result {
            Ok(entries) => return Some(entries),
            Err(StoreError::NoGroup { .. }) if !recreated => {
                warn!("Consumer group disappeared, recreating");
                recreated = true;
                group::ensure_group(
                    ctx.store.as_ref(),
                    &ctx.topic,
                    &ctx.group,
                    ctx.mode.start_cursor(),
                    &ctx.config.retry,
                )
                .await
                .ok()?;
            }
            Err(e) => {
                error!(error = %e, "Reading from stream failed, closing subscription");
                return None;
            }
        }
    }
}

/// Wait before replaying a nacked entry. `false` if stopped meanwhile.
async fn pause(ctx: &mut LoopContext) -> bool {
    let sleep = ctx.config.nack_resend_sleep;
    tokio::select! {
        _ = tokio::time::sleep(sleep) => true,
        _ = ctx.stopped() => false,
    }
}

async fn acknowledge(ctx: &LoopContext, entry_id: EntryId) {
    let ids = [entry_id];
    let result = ctx
        .config
        .retry
        .run("acknowledge", || {
            ctx.store.acknowledge(&ctx.topic, &ctx.group, &ids)
        })
        .await;
    match result {
        Ok(_) => debug!(entry_id = %entry_id, "Acknowledged entry"),
        Err(e) => error!(
            entry_id = %entry_id,
            error = %e,
            "Failed to acknowledge entry, it stays pending"
        ),
    }
}
