use std::collections::HashMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::error::ClusterResult;
use crate::cluster::membership::Membership;
use crate::cluster::message::{Request, Response};
use crate::cluster::transport::Transport;
use crate::clock::lamport::LamportClock;

/// Computes the Berkeley round result from the collected samples: the
/// arithmetic mean and each participant's signed adjustment
/// (`mean - reported`). Returns `None` when no sample was collected.
pub fn compute_adjustments(samples: &HashMap<u32, u64>) -> Option<(u64, HashMap<u32, i64>)> {
    if samples.is_empty() {
        return None;
    }
    let sum: u128 = samples.values().map(|&t| t as u128).sum();
    let mean = ((sum as f64) / (samples.len() as f64)).round() as u64;
    let adjustments = samples
        .iter()
        .map(|(&id, &time)| (id, mean as i64 - time as i64))
        .collect();
    Some((mean, adjustments))
}

/// One leader-driven synchronization round. Collects the local time plus each
/// reachable peer's reported time over the clock-sync call, averages the
/// samples, then pushes every participant its adjusted time over the same
/// call. Unreachable peers are excluded from the round, not treated as zero;
/// they are retried on the next cycle.
pub async fn synchronize<T: Transport>(
    self_id: u32,
    clock: &LamportClock,
    membership: &Membership,
    transport: &T,
    call_timeout: std::time::Duration,
) {
    let local_time = clock.current();
    let mut samples: HashMap<u32, u64> = HashMap::new();
    samples.insert(self_id, local_time);

    for peer_id in membership.active_ids() {
        match collect_peer_time(transport, peer_id, local_time, self_id, call_timeout).await {
            Ok(time) => {
                debug!(peer_id, time, "collected peer time");
                clock.record_peer(peer_id, time);
                samples.insert(peer_id, time);
            }
            Err(e) => warn!(peer_id, error = %e, "peer excluded from clock sync round"),
        }
    }

    let Some((mean, adjustments)) = compute_adjustments(&samples) else {
        return;
    };

    for (&participant, &adjustment) in &adjustments {
        let adjusted = apply_adjustment(samples[&participant], adjustment);
        if participant == self_id {
            clock.adjust(adjusted);
            continue;
        }
        let push = Request::SynchronizeClocks {
            local_time: adjusted,
            requesting_server_id: self_id,
        };
        match timeout(call_timeout, transport.call(participant, push)).await {
            Ok(Ok(_)) => debug!(peer_id = participant, adjustment, "clock adjustment sent"),
            Ok(Err(e)) => warn!(peer_id = participant, error = %e, "failed to push clock adjustment"),
            Err(_) => warn!(peer_id = participant, "clock adjustment push timed out"),
        }
    }

    info!(mean, participants = samples.len(), "clock synchronization round completed");
}

async fn collect_peer_time<T: Transport>(
    transport: &T,
    peer_id: u32,
    local_time: u64,
    self_id: u32,
    call_timeout: std::time::Duration,
) -> ClusterResult<u64> {
    let request = Request::SynchronizeClocks {
        local_time,
        requesting_server_id: self_id,
    };
    let response = timeout(call_timeout, transport.call(peer_id, request))
        .await
        .map_err(|_| crate::cluster::error::ClusterError::CallTimeout(peer_id))??;
    match response {
        Response::ClockSync {
            adjusted_time,
            success: true,
        } => Ok(adjusted_time),
        _ => Err(crate::cluster::error::ClusterError::UnexpectedResponse(
            peer_id,
        )),
    }
}

fn apply_adjustment(reported: u64, adjustment: i64) -> u64 {
    if adjustment.is_negative() {
        reported.saturating_sub(adjustment.unsigned_abs())
    } else {
        reported + adjustment as u64
    }
}
