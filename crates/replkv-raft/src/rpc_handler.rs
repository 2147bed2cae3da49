//! RPC handler loop for processing incoming Raft RPCs.
//!
//! Bridges the transport (which delivers [`RpcMessage`]s) to the
//! `RaftState` handlers, and answers through each message's oneshot.
//!
//! ```text
//! Transport receives RPC → RpcMessage → rpc_handler_loop
//!     ↓
//! RaftState::handle_XXX → response_tx
//! ```

use crate::error::RaftError;
use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

/// RPC handler loop.
///
/// Exits on shutdown or when every sender for `rpc_rx` is gone.
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    election_timer: Arc<ElectionTimer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => {
                match msg {
                    Some(msg) => handle_rpc_message(&state, &election_timer, msg).await,
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!(node = %state.node_id(), "RPC handler loop shutting down");
                break;
            }
        }
    }
}

/// A failed handler drops the responder; the caller sees a closed channel
/// and treats it like a lost message.
fn log_handler_error(rpc: &str, err: &RaftError) {
    match err {
        RaftError::StorageFailure { .. } => {
            tracing::debug!(rpc, error = %err, "Refusing RPC on failed node")
        }
        _ => tracing::error!(rpc, error = %err, "RPC handler failed"),
    }
}

async fn handle_rpc_message(state: &RaftState, election_timer: &ElectionTimer, msg: RpcMessage) {
    match msg {
        RpcMessage::RequestVote { request, response_tx } => {
            match state.handle_request_vote(request).await {
                Ok(resp) => {
                    // Granting a vote defers our own candidacy.
                    if resp.vote_granted {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => log_handler_error("RequestVote", &e),
            }
        }

        RpcMessage::AppendEntries { request, response_tx } => {
            let term = request.term;
            match state.handle_append_entries(request).await {
                Ok(resp) => {
                    // Any message from the current leader counts, even a
                    // rejected one: it still proves the leader is alive.
                    if resp.term == term {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => log_handler_error("AppendEntries", &e),
            }
        }

        RpcMessage::InstallSnapshot { request, response_tx } => {
            let term = request.term;
            match state.handle_install_snapshot(request).await {
                Ok(resp) => {
                    if resp.term == term {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => log_handler_error("InstallSnapshot", &e),
            }
        }
    }
}
