//! Log replication for Raft.
//!
//! - Leader sends AppendEntries RPCs to replicate log entries
//! - AppendEntries also serves as heartbeat (prevents elections)
//! - Followers whose next entry was compacted away get the latest snapshot
//! - Leader commits entries once a quorum stores them (see `RaftState`)
//! - Leader steps down when a quorum stops answering

use crate::error::{RaftError, Result};
use crate::state::{RaftState, ReplicationPlan};
use crate::transport::RaftTransport;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Replicate to a single follower.
///
/// The request is built under the consensus lock and sent without it; the
/// response is applied after re-checking the term. Returns true if the
/// follower acknowledged.
pub async fn replicate_to_follower(
    state: &RaftState,
    follower: &NodeId,
    transport: &dyn RaftTransport,
) -> Result<bool> {
    let rpc_timeout = state.config().rpc_timeout;

    match state.replication_plan(follower).await {
        None => Ok(false),
        Some(ReplicationPlan::Append(request)) => {
            let term = request.term;
            let sent = request.entries.len();
            let response = match timeout(rpc_timeout, transport.append_entries(follower, request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::trace!(follower = %follower, error = %e, "AppendEntries failed");
                    return Ok(false);
                }
                Err(_) => {
                    tracing::trace!(follower = %follower, "AppendEntries timed out");
                    return Ok(false);
                }
            };
            if sent > 0 {
                tracing::debug!(
                    follower = %follower,
                    entries = sent,
                    success = response.success,
                    match_index = %response.match_index,
                    "AppendEntries response"
                );
            }
            let success = response.success;
            state.on_append_response(follower, term, response).await?;
            Ok(success)
        }
        Some(ReplicationPlan::Snapshot { term }) => {
            let Some(snapshot) = state.snapshots().latest().await? else {
                return Err(RaftError::Internal {
                    reason: format!("follower {} needs compacted entries but no snapshot exists", follower),
                });
            };
            let index = snapshot.index();
            tracing::info!(
                follower = %follower,
                snapshot_index = %index,
                bytes = snapshot.data.len(),
                "Sending snapshot to follower"
            );
            let request = InstallSnapshotRequest {
                term,
                leader_id: state.node_id().clone(),
                metadata: snapshot.metadata,
                data: snapshot.data,
            };
            // Snapshots can be large; allow them a few RPC timeouts.
            let response = match timeout(rpc_timeout * 4, transport.install_snapshot(follower, request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::debug!(follower = %follower, error = %e, "InstallSnapshot failed");
                    return Ok(false);
                }
                Err(_) => {
                    tracing::debug!(follower = %follower, "InstallSnapshot timed out");
                    return Ok(false);
                }
            };
            state.on_snapshot_response(follower, term, index, response).await?;
            Ok(true)
        }
    }
}

/// Heartbeat loop for leader.
///
/// Every `heartbeat_interval`, or as soon as a proposal asks for it, sends
/// AppendEntries (heartbeat or with entries) to all followers in parallel,
/// then checks that a quorum is still reachable.
pub async fn heartbeat_loop(
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(state.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.replication_requested() => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!(node = %state.node_id(), "Heartbeat loop shutting down");
                break;
            }
        }

        if state.role() != Role::Leader {
            continue;
        }

        let followers = state.followers();
        let rounds = followers
            .iter()
            .map(|follower| replicate_to_follower(&state, follower, transport.as_ref()));
        for result in futures::future::join_all(rounds).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Replication error");
            }
        }

        if let Err(e) = state.check_quorum().await {
            tracing::error!(error = %e, "Quorum check failed");
        }
    }
}
