//! Per-client-command handlers: `spec.md` §4.4.
//!
//! One [`ClientState`] is owned by each client connection's task; it is
//! never shared, so the recent-load cursor needs no lock (§4.7). Every
//! handler here runs under the caller's client guard from [`crate::gate`],
//! so a rebalance pass never observes a command mid-flight.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::index::IndexError;
use crate::server::Controller;
use crate::wire::codec::{self, CodecError};
use crate::wire::message::{ClientReply, ClientRequest, NodeOutbound};

/// Per-connection client-side state: just the recent-load cursor.
///
/// Tracks the filename the cursor belongs to alongside the ports already
/// offered for it, since a `RELOAD` for a *different* file than the last
/// `LOAD`/`RELOAD` starts a fresh cursor rather than reusing a stale one.
#[derive(Debug, Default)]
pub struct ClientState {
    cursor: Option<(String, Vec<u16>)>,
}

impl ClientState {
    fn clear(&mut self) {
        self.cursor = None;
    }

    /// Returns the next replica port not yet offered for `name`, appending
    /// it to the cursor. `None` once every replica has been offered.
    fn next_replica(&mut self, name: &str, replicas: &[u16]) -> Option<u16> {
        let (cursor_name, offered) = self.cursor.get_or_insert_with(|| (name.to_string(), Vec::new()));
        if cursor_name != name {
            *cursor_name = name.to_string();
            offered.clear();
        }
        for &port in replicas {
            if !offered.contains(&port) {
                offered.push(port);
                return Some(port);
            }
        }
        None
    }
}

/// Dispatches one parsed client command, writing whatever reply (if any)
/// the protocol calls for directly to `writer`.
#[instrument(skip(controller, state, writer, request), fields(cmd = ?request))]
pub async fn handle<W>(
    controller: &Controller,
    state: &mut ClientState,
    request: ClientRequest,
    writer: &mut W,
) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    if !request.is_reload() {
        state.clear();
    }

    // Every `ClientRequest` variant is subject to the admission guard
    // (`spec.md` §4.4); `JOIN` never reaches this dispatcher because
    // `server::Controller` intercepts it at connection-takeover time.
    if controller.registry.len() < controller.config.replication_factor {
        return reply(writer, &ClientReply::ErrorNotEnoughDstores).await;
    }

    match request {
        ClientRequest::Store { name, size } => handle_store(controller, &name, size, writer).await,
        ClientRequest::Load { name } => handle_load(controller, state, &name, writer).await,
        ClientRequest::Reload { name } => handle_load(controller, state, &name, writer).await,
        ClientRequest::Remove { name } => handle_remove(controller, &name, writer).await,
        ClientRequest::List => handle_list(controller, writer).await,
    }
}

async fn reply<W>(writer: &mut W, msg: &ClientReply) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    codec::write_line(writer, &msg.to_string()).await
}

async fn handle_list<W>(controller: &Controller, writer: &mut W) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    let files = controller.index.snapshot_visible();
    reply(writer, &ClientReply::List(files)).await
}

async fn handle_load<W>(
    controller: &Controller,
    state: &mut ClientState,
    name: &str,
    writer: &mut W,
) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    let Some(entry) = controller.index.get(name) else {
        return reply(writer, &ClientReply::ErrorFileDoesNotExist).await;
    };
    if !matches!(entry.status, crate::index::FileStatus::StoreComplete) {
        return reply(writer, &ClientReply::ErrorFileDoesNotExist).await;
    }
    match state.next_replica(name, &entry.replicas) {
        Some(port) => reply(writer, &ClientReply::LoadFrom { port, size: entry.size }).await,
        None => reply(writer, &ClientReply::ErrorLoad).await,
    }
}

async fn handle_store<W>(
    controller: &Controller,
    name: &str,
    size: u64,
    writer: &mut W,
) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    if controller.index.get(name).is_some() {
        return reply(writer, &ClientReply::ErrorFileAlreadyExists).await;
    }

    let r = controller.config.replication_factor;
    let replicas = match controller.registry.select_least_loaded(r) {
        Ok(ports) => ports,
        Err(_) => return reply(writer, &ClientReply::ErrorNotEnoughDstores).await,
    };

    match controller.index.admit_store(name, size, replicas.clone()) {
        Ok(()) => {}
        Err(IndexError::AlreadyExists) => {
            return reply(writer, &ClientReply::ErrorFileAlreadyExists).await;
        }
        Err(IndexError::DoesNotExist) => unreachable!("admit_store never returns DoesNotExist"),
    }

    reply(writer, &ClientReply::StoreTo(replicas.clone())).await?;

    let waiters: Vec<_> = replicas
        .iter()
        .filter_map(|&port| controller.registry.get(port).map(|s| s.register_store_ack(name)))
        .collect();

    let all_acked = waiters.len() == replicas.len() && await_all(waiters, controller.config.timeout()).await;

    if all_acked {
        controller.index.mark_store_complete(name);
        info!(file = name, replicas = ?replicas, "store complete");
        reply(writer, &ClientReply::StoreComplete).await
    } else {
        controller.index.drop_entry(name);
        warn!(file = name, "store timed out, dropping index entry");
        Ok(())
    }
}

async fn handle_remove<W>(controller: &Controller, name: &str, writer: &mut W) -> Result<(), CodecError>
where
    W: AsyncWriteExt + Unpin,
{
    let Some(entry) = controller.index.get(name) else {
        return reply(writer, &ClientReply::ErrorFileDoesNotExist).await;
    };
    if controller.index.admit_remove(name).is_err() {
        return reply(writer, &ClientReply::ErrorFileDoesNotExist).await;
    }

    let mut waiters = Vec::with_capacity(entry.replicas.len());
    for &port in &entry.replicas {
        let Some(session) = controller.registry.get(port) else { continue };
        let rx = session.register_remove_ack(name);
        if session.send_line(&NodeOutbound::Remove(name.to_string()).to_string()).await.is_err() {
            debug!(port, file = name, "failed to send REMOVE to node");
        }
        waiters.push(rx);
    }

    let all_acked =
        waiters.len() == entry.replicas.len() && await_all(waiters, controller.config.timeout()).await;

    if all_acked {
        controller.index.drop_entry(name);
        info!(file = name, "remove complete");
        reply(writer, &ClientReply::RemoveComplete).await
    } else {
        warn!(file = name, "remove timed out, leaving entry for the next rebalance");
        Ok(())
    }
}

/// Awaits every oneshot in `waiters` within `deadline`, returning whether
/// all of them resolved successfully.
async fn await_all<T>(waiters: Vec<tokio::sync::oneshot::Receiver<T>>, deadline: Duration) -> bool
where
    T: Send,
{
    match tokio::time::timeout(deadline, join_all(waiters)).await {
        Ok(results) => results.iter().all(std::result::Result::is_ok),
        Err(_elapsed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_offers_replicas_in_order_without_repeats() {
        let mut state = ClientState::default();
        let replicas = vec![4001, 4002, 4003];
        assert_eq!(state.next_replica("a.txt", &replicas), Some(4001));
        assert_eq!(state.next_replica("a.txt", &replicas), Some(4002));
        assert_eq!(state.next_replica("a.txt", &replicas), Some(4003));
        assert_eq!(state.next_replica("a.txt", &replicas), None);
    }

    #[test]
    fn cursor_resets_for_a_different_file() {
        let mut state = ClientState::default();
        assert_eq!(state.next_replica("a.txt", &[4001, 4002]), Some(4001));
        assert_eq!(state.next_replica("b.txt", &[4003, 4004]), Some(4003));
    }

    #[test]
    fn clear_drops_the_cursor() {
        let mut state = ClientState::default();
        state.next_replica("a.txt", &[4001, 4002]);
        state.clear();
        assert_eq!(state.next_replica("a.txt", &[4001, 4002]), Some(4001));
    }
}
