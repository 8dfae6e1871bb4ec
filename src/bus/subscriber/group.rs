//! Consumer group bootstrap and teardown.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, Result};
use crate::storage::{StartCursor, StreamStore};
use crate::utils::retry::RetryPolicy;

/// Unique private group name for one fan-out subscription.
pub fn fan_out_group_name(topic: &str, consumer: &str) -> String {
    format!("{}:fanout:{}:{}", topic, consumer, Uuid::new_v4())
}

/// Create `group` on `topic` unless it exists. Returns whether it was created.
///
/// An existing group keeps its cursor.
pub(crate) async fn ensure_group(
    store: &dyn StreamStore,
    topic: &str,
    group: &str,
    start: StartCursor,
    retry: &RetryPolicy,
) -> Result<bool> {
    match retry
        .run("create_group", || store.create_group(topic, group, start))
        .await
    {
        Ok(true) => {
            info!(topic = %topic, group = %group, start = ?start, "Created consumer group");
            Ok(true)
        }
        Ok(false) => {
            debug!(topic = %topic, group = %group, "Consumer group already exists");
            Ok(false)
        }
        Err(e) => {
            error!(topic = %topic, group = %group, error = %e, "Failed to create consumer group");
            Err(BusError::GroupCreateFailed {
                topic: topic.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Destroy a group, logging failures.
pub(crate) async fn remove_group(store: &dyn StreamStore, topic: &str, group: &str) {
    match store.destroy_group(topic, group).await {
        Ok(true) => debug!(topic = %topic, group = %group, "Removed consumer group"),
        Ok(false) => {}
        Err(e) => warn!(topic = %topic, group = %group, error = %e, "Failed to remove consumer group"),
    }
}
