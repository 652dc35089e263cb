//! Deterministic role assignment and reconnect pacing

use std::time::Duration;

use crate::config::MeshConfig;

/// Whether `local` sends the offer to `remote`
///
/// The lexicographically smaller identifier always offers, so both sides
/// agree without an extra negotiation round.
pub fn is_offerer(local: &str, remote: &str) -> bool {
    local < remote
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(attempt: u32, config: &MeshConfig) -> Duration {
    let ms = (attempt as u64)
        .saturating_mul(config.reconnect_base_delay_ms)
        .min(config.reconnect_max_delay_ms);
    Duration::from_millis(ms)
}
