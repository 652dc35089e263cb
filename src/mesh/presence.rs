//! Presence snapshot reconciliation and lifecycle writes

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::Result;
use crate::signaling::{PresenceChannel, PresenceEntry, SignalingChannel};
use crate::utils::short_id;

/// What one presence snapshot means for the local participant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    /// Live entries, stale ones filtered out
    pub users: Vec<PresenceEntry>,
    /// Participants to mesh with
    pub others: HashSet<String>,
    /// Entries any observer should delete
    pub garbage: Vec<String>,
}

/// Interpret a presence snapshot taken at `now_ms`
pub fn reconcile(
    snapshot: &[PresenceEntry],
    local_uid: &str,
    config: &MeshConfig,
    now_ms: i64,
) -> PresenceView {
    let mut view = PresenceView::default();

    let fresh: Vec<&PresenceEntry> = snapshot
        .iter()
        .filter(|entry| {
            let stale = now_ms.saturating_sub(entry.joined_at) > config.presence_ttl_ms;
            if stale {
                view.garbage.push(entry.uid.clone());
            }
            !stale
        })
        .collect();

    let present: HashSet<&str> = fresh.iter().map(|e| e.uid.as_str()).collect();

    for entry in fresh {
        if entry.uid == config.agent_uid {
            // The agent only lives as long as whoever summoned it
            if let Some(summoner) = entry.summoned_by.as_deref() {
                if !present.contains(summoner) {
                    view.garbage.push(entry.uid.clone());
                    continue;
                }
            }
        }
        if entry.uid != local_uid && entry.uid != config.agent_uid && !entry.is_bot {
            view.others.insert(entry.uid.clone());
        }
        view.users.push(entry.clone());
    }
    view
}

/// Delete entries flagged by [`reconcile`]; failures are logged only
pub async fn collect_garbage(presence: &Arc<dyn PresenceChannel>, garbage: &[String]) {
    for uid in garbage {
        match presence.delete(uid).await {
            Ok(()) => info!("Removed stale presence entry for {}", short_id(uid)),
            Err(e) => debug!("Stale presence delete for {} failed: {}", short_id(uid), e),
        }
    }
}

/// Write the local participant's presence entry
pub async fn announce(presence: &Arc<dyn PresenceChannel>, entry: PresenceEntry) -> Result<()> {
    let uid = entry.uid.clone();
    presence.set(entry).await?;
    debug!("Presence written for {}", short_id(&uid));
    Ok(())
}

/// Remove the local participant's presence entry and every signaling
/// document still sent from or to it
pub async fn withdraw(
    presence: &Arc<dyn PresenceChannel>,
    signaling: &Arc<dyn SignalingChannel>,
    uid: &str,
) {
    if let Err(e) = presence.delete(uid).await {
        debug!("Presence delete for {} failed: {}", short_id(uid), e);
    }

    let documents = match signaling.list().await {
        Ok(docs) => docs,
        Err(e) => {
            warn!("Failed to list signaling documents: {}", e);
            return;
        }
    };
    let mut removed = 0;
    for doc in documents {
        let from = doc.body.get("from").and_then(|v| v.as_str());
        let to = doc.body.get("to").and_then(|v| v.as_str());
        if from == Some(uid) || to == Some(uid) {
            if signaling.delete(&doc.id).await.is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!("Removed {} leftover signaling documents", removed);
    }
}
